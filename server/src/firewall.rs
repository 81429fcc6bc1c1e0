use crate::runner::{CommandOutput, CommandRunner};
use crate::ServerError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Adapter over the `iptables` binary. All mutating and listing calls are
/// serialised behind one process-wide mutex; the binary is not safe against
/// concurrent invocations of itself.
pub struct Firewall {
    mu: Mutex<()>,
    runner: Arc<dyn CommandRunner>,
}

fn valid_protocol(protocol: &str) -> bool {
    matches!(protocol, "tcp" | "udp" | "icmp")
}

impl Firewall {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            mu: Mutex::new(()),
            runner,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ServerError> {
        Ok(self.runner.run(program, args)?)
    }

    /// Runs `iptables` and turns a non-zero exit into an error carrying the
    /// combined output, like `CombinedOutput` consumers expect.
    fn iptables(&self, args: &[&str]) -> Result<CommandOutput, ServerError> {
        let out = self.run("iptables", args)?;
        if !out.success {
            return Err(ServerError::invalid(out.text().trim().to_string()));
        }
        Ok(out)
    }

    fn exists_inner(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<bool, ServerError> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(rulespec);
        Ok(self.run("iptables", &args)?.success)
    }

    fn insert_unique_inner(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rulespec: &[&str],
    ) -> Result<(), ServerError> {
        if self.exists_inner(table, chain, rulespec)? {
            return Ok(());
        }
        let position = position.to_string();
        let mut args = vec!["-t", table, "-I", chain, position.as_str()];
        args.extend_from_slice(rulespec);
        self.iptables(&args)?;
        Ok(())
    }

    fn delete_if_exists_inner(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<(), ServerError> {
        if !self.exists_inner(table, chain, rulespec)? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(rulespec);
        self.iptables(&args)?;
        Ok(())
    }

    fn list_inner(&self, table: &str, chain: &str) -> Result<Vec<String>, ServerError> {
        let out = self.iptables(&["-t", table, "-S", chain])?;
        Ok(out.text().lines().map(str::to_string).collect())
    }

    /// Inserts the rulespec at `position` unless an equivalent rule is
    /// already present in the chain.
    pub fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rulespec: &[&str],
    ) -> Result<(), ServerError> {
        let _guard = self.mu.lock();
        self.insert_unique_inner(table, chain, position, rulespec)
    }

    pub fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<(), ServerError> {
        let _guard = self.mu.lock();
        self.delete_if_exists_inner(table, chain, rulespec)
    }

    pub fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, ServerError> {
        let _guard = self.mu.lock();
        self.list_inner(table, chain)
    }

    pub fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ServerError> {
        let _guard = self.mu.lock();
        self.iptables(&["-t", table, "-F", chain])?;
        Ok(())
    }

    /// An equivalent icmp rule appended by an earlier write makes a second
    /// write fail; `iptables-save` is the only listing that prints the exact
    /// appended form.
    fn icmp_rule_exists(
        &self,
        source: &str,
        destination: &str,
        comment: &str,
    ) -> Result<(), ServerError> {
        let out = self.run("iptables-save", &[])?;
        if !out.success {
            return Err(ServerError::invalid(format!(
                "cannot read iptables-save: {}",
                out.text().trim()
            )));
        }
        let signature = format!(
            "-A FORWARD -s {source} -d {destination} -p icmp -m comment --comment \"{comment}\" -j ACCEPT"
        );
        if out.text().contains(&signature) {
            return Err(ServerError::invalid("this rule already exist"));
        }
        Ok(())
    }

    /// Writes or deletes one FORWARD rule between two CIDR endpoints.
    ///
    /// The `!` destination negation is emitted when `except` is *false*; the
    /// flag's meaning is inverted relative to its name, and the wire format
    /// relies on it staying that way.
    #[allow(clippy::too_many_arguments)]
    pub fn set_forward(
        &self,
        position: u32,
        port: &str,
        action: &str,
        command: &str,
        source: &str,
        destination: &str,
        protocol: &str,
        comment: &str,
        except: bool,
    ) -> Result<(), ServerError> {
        let _guard = self.mu.lock();

        let port = port.trim();
        if !valid_protocol(protocol) {
            return Err(ServerError::invalid("typePort can be: tcp, udp, icmp"));
        }
        let position_str = position.to_string();

        match command {
            "write" => {
                if protocol == "icmp" {
                    self.icmp_rule_exists(source, destination, comment)?;
                    let mut args = vec!["-I", "FORWARD", position_str.as_str(), "-s", source];
                    if !except {
                        args.push("!");
                    }
                    args.extend_from_slice(&[
                        "-d", destination, "-p", "icmp", "-j", action, "-m", "comment",
                        "--comment", comment,
                    ]);
                    self.iptables(&args)?;
                    return Ok(());
                }

                let mut args = vec!["-s", source];
                if !except {
                    args.push("!");
                }
                args.extend_from_slice(&[
                    "-d", destination, "-j", action, "-m", "comment", "--comment", comment,
                ]);
                if !port.is_empty() {
                    args.extend_from_slice(&["-p", protocol, "-m", "multiport", "--dport", port]);
                }

                self.insert_unique_inner("filter", "FORWARD", position, &args)
            }
            "delete" => {
                let mut args = vec!["-s", source];
                if !except {
                    args.push("!");
                }
                args.extend_from_slice(&[
                    "-d", destination, "-j", action, "-m", "comment", "--comment", comment,
                ]);
                if protocol == "icmp" {
                    args.extend_from_slice(&["-p", "icmp"]);
                } else if !port.is_empty() {
                    args.extend_from_slice(&["-p", protocol, "-m", "multiport", "--dport", port]);
                }

                self.delete_if_exists_inner("filter", "FORWARD", &args)
            }
            "" => Err(ServerError::invalid("empty value of command")),
            other => Err(ServerError::invalid(format!("command not found: {other}"))),
        }
    }

    /// Writes or deletes a list rule: the main rule matches an ipset via
    /// `--match-set`, and a companion icmp rule (comment `icmp_<comment>`)
    /// lets ping traffic follow the same policy.
    #[allow(clippy::too_many_arguments)]
    pub fn set_forward_list(
        &self,
        position: u32,
        port: &str,
        action: &str,
        command: &str,
        source: &str,
        list_set_name: &str,
        protocol: &str,
        comment: &str,
        except: bool,
    ) -> Result<(), ServerError> {
        let _guard = self.mu.lock();

        if !valid_protocol(protocol) {
            return Err(ServerError::invalid("typePort can be: tcp, udp, icmp"));
        }

        let position_str = position.to_string();
        let port = port.trim();
        let icmp_comment = format!("icmp_{comment}");

        let mut icmp_tail: Vec<&str> = vec!["-s", source, "-m", "set"];
        if !except {
            icmp_tail.push("!");
        }
        icmp_tail.extend_from_slice(&[
            "--match-set",
            list_set_name,
            "dst",
            "-p",
            "icmp",
            "-j",
            action,
            "-m",
            "comment",
            "--comment",
            &icmp_comment,
        ]);

        let mut main_args = vec!["-s", source, "-m", "set"];
        if !except {
            main_args.push("!");
        }
        main_args.extend_from_slice(&["--match-set", list_set_name, "dst"]);
        if !port.is_empty() {
            main_args.extend_from_slice(&["-p", protocol, "-m", "multiport", "--dport", port]);
        }
        main_args.extend_from_slice(&["-j", action, "-m", "comment", "--comment", comment]);

        match command {
            "write" => {
                let out = self.run("iptables", &["-nvL"])?;
                if !out.success {
                    return Err(ServerError::invalid(out.text().trim().to_string()));
                }
                if !out.text().contains(&icmp_comment) {
                    let mut args = vec!["-I", "FORWARD", position_str.as_str()];
                    args.extend_from_slice(&icmp_tail);
                    self.iptables(&args)?;
                }
                self.insert_unique_inner("filter", "FORWARD", position, &main_args)
            }
            "delete" => {
                let mut args = vec!["-D", "FORWARD"];
                args.extend_from_slice(&icmp_tail);
                self.iptables(&args)?;
                self.delete_if_exists_inner("filter", "FORWARD", &main_args)
            }
            "" => Err(ServerError::invalid("empty value of command")),
            other => Err(ServerError::invalid(format!("command not found: {other}"))),
        }
    }

    pub fn set_masquerade(
        &self,
        command: &str,
        subnet: &str,
        ifname: &str,
        comment: &str,
    ) -> Result<(), ServerError> {
        let _guard = self.mu.lock();

        let rulespec = [
            "-s", subnet, "-o", ifname, "-j", "MASQUERADE", "-m", "comment", "--comment", comment,
        ];
        match command {
            "write" => self.insert_unique_inner("nat", "POSTROUTING", 1, &rulespec),
            "delete" => self.delete_if_exists_inner("nat", "POSTROUTING", &rulespec),
            "" => Err(ServerError::invalid("iptable command value is empty")),
            other => Err(ServerError::invalid(format!(
                "iptable did not find command {other}"
            ))),
        }
    }

    pub fn forward_list(&self) -> Result<Vec<String>, ServerError> {
        let _guard = self.mu.lock();
        self.list_inner("filter", "FORWARD")
    }

    pub fn masquerade_list(&self) -> Result<Vec<String>, ServerError> {
        let _guard = self.mu.lock();
        self.list_inner("nat", "POSTROUTING")
    }

    pub fn flush_forward(&self) -> Result<(), ServerError> {
        self.clear_chain("filter", "FORWARD")
    }
}
