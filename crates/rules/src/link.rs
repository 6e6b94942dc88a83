//! Link-mode rule plane: dummy interface + ipset + iptables masquerade.
//!
//! Traffic to VIP:port is matched via an ipset, marked in a dedicated NAT
//! chain, and masqueraded on the way out so return traffic routes back
//! through this node. A canary chain is watched in the background and the
//! whole chain set is rebuilt if an external firewall reload flushes it.

use crate::Ruler;
use crate::exec::{already_exists, not_found, run};
use async_trait::async_trait;
use common::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

const VIP_SET: &str = "VIRTUAL-IP";
const VIP_SET_COMMENT: &str = "virtual service ip + port for masquerade purpose";

const SERVICES_CHAIN: &str = "VIRTUAL-SERVICES";
const POSTROUTING_CHAIN: &str = "VIRTUAL-POSTROUTING";
const MARK_MASQ_CHAIN: &str = "VIRTUAL-MARK-MASQ";
const CANARY_CHAIN: &str = "VIRTUAL-CANARY";

const SYSCTL_VS_CONNTRACK: &str = "/proc/sys/net/ipv4/vs/conntrack";

const CANARY_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Chains owned by this ruler. The canary chain exists in both tables so a
/// flush of either is detected.
const CHAINS: [(Table, &str); 5] = [
    (Table::Nat, SERVICES_CHAIN),
    (Table::Nat, POSTROUTING_CHAIN),
    (Table::Nat, MARK_MASQ_CHAIN),
    (Table::Nat, CANARY_CHAIN),
    (Table::Filter, CANARY_CHAIN),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Nat,
    Filter,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Append,
    Prepend,
}

impl Position {
    fn flag(self) -> &'static str {
        match self {
            Position::Append => "-A",
            Position::Prepend => "-I",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RuleSpec {
    position: Position,
    table: Table,
    chain: &'static str,
    args: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Jump rules linking the standard chains into ours. Append semantics.
fn jump_rules() -> Vec<RuleSpec> {
    let portals = |from: &'static str| RuleSpec {
        position: Position::Append,
        table: Table::Nat,
        chain: from,
        args: argv(&[
            "-m",
            "comment",
            "--comment",
            "virtual service portals",
            "-j",
            SERVICES_CHAIN,
        ]),
    };
    vec![
        portals("OUTPUT"),
        portals("PREROUTING"),
        RuleSpec {
            position: Position::Append,
            table: Table::Nat,
            chain: "POSTROUTING",
            args: argv(&[
                "-m",
                "comment",
                "--comment",
                "virtual service postrouting rules",
                "-j",
                POSTROUTING_CHAIN,
            ]),
        },
    ]
}

/// Rule bodies inside our chains, plus the filter-table accept rule.
fn chain_rules(mark: &str, random_fully: bool) -> Vec<RuleSpec> {
    let mut rules = vec![
        // match the VIP set and hand off for marking
        RuleSpec {
            position: Position::Append,
            table: Table::Nat,
            chain: SERVICES_CHAIN,
            args: argv(&[
                "-m",
                "comment",
                "--comment",
                VIP_SET_COMMENT,
                "-m",
                "set",
                "--match-set",
                VIP_SET,
                "dst,dst",
                "-j",
                MARK_MASQ_CHAIN,
            ]),
        },
        RuleSpec {
            position: Position::Append,
            table: Table::Nat,
            chain: MARK_MASQ_CHAIN,
            args: argv(&["-j", "MARK", "--or-mark", mark]),
        },
        // return early for packets that were never marked
        RuleSpec {
            position: Position::Append,
            table: Table::Nat,
            chain: POSTROUTING_CHAIN,
            args: argv(&["-m", "mark", "!", "--mark", mark, "-j", "RETURN"]),
        },
        // Accept marked packets at the very top of filter OUTPUT. CNI rule
        // sets must stay behind this one, hence prepend; cilium for example
        // must run with `prepend-iptables-chains: false`.
        RuleSpec {
            position: Position::Prepend,
            table: Table::Filter,
            chain: "OUTPUT",
            args: argv(&[
                "-m",
                "comment",
                "--comment",
                "accept for all marked by vipcare",
                "-m",
                "mark",
                "--mark",
                mark,
                "-j",
                "ACCEPT",
            ]),
        },
    ];
    let mut masq = argv(&[
        "-m",
        "comment",
        "--comment",
        "virtual service traffic requiring SNAT",
        "-j",
        "MASQUERADE",
    ]);
    if random_fully {
        masq.push("--random-fully".to_string());
    }
    rules.push(RuleSpec {
        position: Position::Append,
        table: Table::Nat,
        chain: POSTROUTING_CHAIN,
        args: masq,
    });
    rules
}

/// Parse `iptables --version` output; `--random-fully` needs 1.6.2.
fn supports_random_fully(version_output: &str) -> bool {
    let Some(version) = version_output
        .split_whitespace()
        .find_map(|token| token.strip_prefix('v'))
    else {
        return false;
    };
    let mut parts = version.split('.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .unwrap_or(0)
    });
    let triple = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    triple >= (1, 6, 2)
}

fn accept_result(result: Result<String>, acceptable: fn(&Error) -> bool) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if acceptable(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Link-mode [`Ruler`].
#[derive(Clone)]
pub struct LinkRuler {
    iface: String,
    masquerade_mark: String,
    vips: Vec<SocketAddr>,
    canary_poll: Duration,
    random_fully: OnceCell<bool>,
}

impl LinkRuler {
    pub fn new(iface: impl Into<String>, masquerade_bit: u8, vips: Vec<SocketAddr>) -> Self {
        let value = 1u32 << u32::from(masquerade_bit.min(31));
        Self {
            iface: iface.into(),
            masquerade_mark: format!("{:#010x}", value),
            vips,
            canary_poll: CANARY_POLL_INTERVAL,
            random_fully: OnceCell::new(),
        }
    }

    /// Override the canary poll interval.
    pub fn with_canary_poll(mut self, interval: Duration) -> Self {
        self.canary_poll = interval;
        self
    }

    async fn ensure_sysctl(&self) -> Result<()> {
        let current = tokio::fs::read_to_string(SYSCTL_VS_CONNTRACK)
            .await
            .map_err(|e| Error::rules(format!("can't read sysctl {}: {}", SYSCTL_VS_CONNTRACK, e)))?;
        if current.trim() != "1" {
            tokio::fs::write(SYSCTL_VS_CONNTRACK, "1")
                .await
                .map_err(|e| {
                    Error::rules(format!("can't set sysctl {} to 1: {}", SYSCTL_VS_CONNTRACK, e))
                })?;
            debug!(sysctl = SYSCTL_VS_CONNTRACK, "changed sysctl to 1");
        }
        Ok(())
    }

    async fn ensure_dummy_device(&self) -> Result<()> {
        accept_result(
            run("ip", &argv(&["link", "add", &self.iface, "type", "dummy"])).await,
            already_exists,
        )?;
        for vip in &self.vips {
            let cidr = format!("{}/32", vip.ip());
            accept_result(
                run("ip", &argv(&["addr", "add", &cidr, "dev", &self.iface])).await,
                already_exists,
            )?;
        }
        Ok(())
    }

    async fn ensure_ipset(&self) -> Result<()> {
        run(
            "ipset",
            &argv(&["create", VIP_SET, "hash:ip,port", "comment", "-exist"]),
        )
        .await?;
        for vip in &self.vips {
            let entry = format!("{},tcp:{}", vip.ip(), vip.port());
            run("ipset", &argv(&["add", VIP_SET, &entry, "-exist"])).await?;
        }
        Ok(())
    }

    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        accept_result(
            run("iptables", &argv(&["-w", "-t", table.name(), "-N", chain])).await,
            already_exists,
        )
    }

    async fn ensure_rule(&self, spec: &RuleSpec) -> Result<()> {
        let mut check = argv(&["-w", "-t", spec.table.name(), "-C", spec.chain]);
        check.extend(spec.args.iter().cloned());
        if run("iptables", &check).await.is_ok() {
            return Ok(());
        }
        let mut add = argv(&["-w", "-t", spec.table.name(), spec.position.flag(), spec.chain]);
        if spec.position == Position::Prepend {
            add.push("1".to_string());
        }
        add.extend(spec.args.iter().cloned());
        run("iptables", &add).await.map(|_| ())
    }

    async fn delete_rule(&self, table: Table, chain: &str, rule_args: &[String]) -> Result<()> {
        let mut args = argv(&["-w", "-t", table.name(), "-D", chain]);
        args.extend(rule_args.iter().cloned());
        accept_result(run("iptables", &args).await, not_found)
    }

    async fn has_random_fully(&self) -> bool {
        *self
            .random_fully
            .get_or_init(|| async {
                match run("iptables", &argv(&["--version"])).await {
                    Ok(out) => supports_random_fully(&out),
                    Err(e) => {
                        debug!(error = %e, "could not detect iptables version");
                        false
                    }
                }
            })
            .await
    }

    async fn ensure_chains(&self) -> Result<()> {
        for (table, chain) in CHAINS {
            self.ensure_chain(table, chain).await.inspect_err(
                |e| error!(table = table.name(), chain, error = %e, "failed to ensure chain"),
            )?;
        }
        for jump in jump_rules() {
            if let Err(e) = self.ensure_rule(&jump).await {
                error!(chain = jump.chain, error = %e, "failed to ensure chain jump");
            }
        }
        let random_fully = self.has_random_fully().await;
        for rule in chain_rules(&self.masquerade_mark, random_fully) {
            self.ensure_rule(&rule).await?;
        }
        Ok(())
    }

    async fn canary_present(&self) -> bool {
        for table in [Table::Nat, Table::Filter] {
            let list = argv(&["-w", "-t", table.name(), "-nL", CANARY_CHAIN]);
            if run("iptables", &list).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Watch the canary chain and rebuild all rules when it disappears.
    /// Runs until process exit.
    fn spawn_canary_watcher(&self) {
        let ruler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ruler.canary_poll).await;
                if ruler.canary_present().await {
                    continue;
                }
                info!("looks like the canary chain has been flushed, rebuilding rules");
                if let Err(e) = ruler.ensure_chains().await {
                    error!(error = %e, "failed to re-ensure iptables chains");
                }
            }
        });
    }
}

#[async_trait]
impl Ruler for LinkRuler {
    async fn setup(&self) -> Result<()> {
        self.ensure_sysctl()
            .await
            .inspect_err(|e| error!(error = %e, "failed to ensure sysctl"))?;
        self.ensure_dummy_device()
            .await
            .inspect_err(|e| error!(error = %e, "failed to ensure dummy device"))?;
        self.ensure_ipset()
            .await
            .inspect_err(|e| error!(error = %e, "failed to ensure ipset"))?;
        self.ensure_chains().await?;
        self.spawn_canary_watcher();
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        info!(iface = %self.iface, "deleting dummy device");
        if let Err(e) = accept_result(
            run("ip", &argv(&["link", "del", &self.iface])).await,
            not_found,
        ) {
            failures.push(e.to_string());
        }

        info!("cleaning up iptables rules");
        for jump in jump_rules() {
            if let Err(e) = self.delete_rule(jump.table, jump.chain, &jump.args).await {
                failures.push(e.to_string());
            }
        }
        // The accept-marked rule lives in the shared filter OUTPUT chain, so
        // it is not covered by the chain flush below.
        for rule in chain_rules(&self.masquerade_mark, false)
            .into_iter()
            .filter(|rule| rule.table == Table::Filter)
        {
            if let Err(e) = self.delete_rule(rule.table, rule.chain, &rule.args).await {
                failures.push(e.to_string());
            }
        }

        // Flush every chain before deleting any: a chain cannot be removed
        // while it is still referenced or non-empty.
        for (table, chain) in CHAINS {
            let flush = argv(&["-w", "-t", table.name(), "-F", chain]);
            if let Err(e) = accept_result(run("iptables", &flush).await, not_found) {
                failures.push(e.to_string());
            }
        }
        for (table, chain) in CHAINS {
            let delete = argv(&["-w", "-t", table.name(), "-X", chain]);
            if let Err(e) = accept_result(run("iptables", &delete).await, not_found) {
                failures.push(e.to_string());
            }
        }

        info!(set = VIP_SET, "destroying ipset");
        if let Err(e) = accept_result(run("ipset", &argv(&["destroy", VIP_SET])).await, not_found) {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::rules(format!(
                "encountered errors while tearing down rules: {}",
                failures.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_mark_format() {
        let ruler = LinkRuler::new("vipcare", 14, vec![]);
        assert_eq!(ruler.masquerade_mark, "0x00004000");

        let ruler = LinkRuler::new("vipcare", 0, vec![]);
        assert_eq!(ruler.masquerade_mark, "0x00000001");
    }

    #[test]
    fn jump_rules_cover_standard_chains() {
        let jumps = jump_rules();
        assert_eq!(jumps.len(), 3);
        let froms: Vec<&str> = jumps.iter().map(|j| j.chain).collect();
        assert_eq!(froms, vec!["OUTPUT", "PREROUTING", "POSTROUTING"]);
        for jump in &jumps {
            assert_eq!(jump.position, Position::Append);
            assert_eq!(jump.table, Table::Nat);
        }
        assert!(jumps[0].args.contains(&SERVICES_CHAIN.to_string()));
        assert!(jumps[2].args.contains(&POSTROUTING_CHAIN.to_string()));
    }

    #[test]
    fn accept_marked_rule_is_prepended_in_filter() {
        let rules = chain_rules("0x00004000", false);
        let accept = rules
            .iter()
            .find(|r| r.table == Table::Filter)
            .expect("filter rule");
        assert_eq!(accept.position, Position::Prepend);
        assert_eq!(accept.chain, "OUTPUT");
        assert!(accept.args.contains(&"ACCEPT".to_string()));
        assert!(accept.args.contains(&"0x00004000".to_string()));
    }

    #[test]
    fn masquerade_rule_respects_random_fully() {
        let without = chain_rules("0x00004000", false);
        let masq = without.last().unwrap();
        assert!(masq.args.contains(&"MASQUERADE".to_string()));
        assert!(!masq.args.contains(&"--random-fully".to_string()));

        let with = chain_rules("0x00004000", true);
        assert!(
            with.last()
                .unwrap()
                .args
                .contains(&"--random-fully".to_string())
        );
    }

    #[test]
    fn services_rule_matches_vip_set() {
        let rules = chain_rules("0x00004000", false);
        let services = rules.iter().find(|r| r.chain == SERVICES_CHAIN).unwrap();
        assert!(services.args.contains(&VIP_SET.to_string()));
        assert!(services.args.contains(&"dst,dst".to_string()));
        assert!(services.args.contains(&MARK_MASQ_CHAIN.to_string()));
    }

    #[test]
    fn random_fully_version_detection() {
        assert!(supports_random_fully("iptables v1.8.7 (nf_tables)"));
        assert!(supports_random_fully("iptables v1.6.2"));
        assert!(!supports_random_fully("iptables v1.6.1"));
        assert!(!supports_random_fully("iptables v1.4.21"));
        assert!(!supports_random_fully("not a version string"));
    }
}
