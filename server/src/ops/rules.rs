use crate::db::{Forward, Masquerade};
use crate::ops::{ForwardReport, MasqueradeReport, RulesReport};
use crate::{netif, Context, ServerError};

fn split_ips(raw: &str) -> Vec<String> {
    raw.replace(' ', "")
        .split(',')
        .map(str::to_string)
        .collect()
}

/// `ipset create <name> hash:ip`, flush, then add every member. An existing
/// set is reused; per-member failures are logged, not fatal.
pub fn create_ipset_list(context: &Context, name: &str, ips: &[String]) -> Result<(), ServerError> {
    let out = context.runner.run("ipset", &["create", name, "hash:ip"])?;
    if !out.success && !out.text().contains("already exists") {
        return Err(ServerError::invalid(out.text().trim().to_string()));
    }

    let out = context.runner.run("ipset", &["flush", name])?;
    if !out.success {
        log::error!("create ipset list: flush {name}: {}", out.text().trim());
    }

    for ip in ips {
        let ip = ip.trim();
        if ip.is_empty() {
            continue;
        }
        let out = context.runner.run("ipset", &["add", name, ip])?;
        if !out.success {
            log::error!("create ipset list: add {ip} to {name}: {}", out.text().trim());
        }
    }
    Ok(())
}

pub fn delete_ipset_list(context: &Context, name: &str) -> Result<(), ServerError> {
    let out = context.runner.run("ipset", &["destroy", name])?;
    if !out.success {
        return Err(ServerError::invalid(out.text().trim().to_string()));
    }
    Ok(())
}

/// Single-entry mode runs `ipset <command> <name> <ip>` per entry, treating
/// "already added"/"not added" as success and a missing set as an explicit
/// error. Bulk mode recreates the whole set.
pub fn update_ipset_list(
    context: &Context,
    command: &str,
    name: &str,
    ips: &[String],
    single: bool,
) -> Result<(), ServerError> {
    if !single {
        return create_ipset_list(context, name, ips);
    }

    for ip in ips {
        let out = context.runner.run("ipset", &[command, name, ip.trim()])?;
        if !out.success {
            let text = out.text().trim().to_string();
            log::error!("update ipset list: {text}");
            if text.contains("name does not exist") {
                return Err(ServerError::invalid(format!(
                    "ipset {name} does not exist check in iptables rules created ipset rules"
                )));
            }
            if text.contains("already added") || text.contains("not added") {
                return Ok(());
            }
            return Err(ServerError::invalid(text));
        }
    }
    Ok(())
}

/// Applies one rule-book command. Writes push the kernel first and persist
/// after; deletes mirror the order (kernel, ipset, then store). The
/// idempotent kernel primitives make the startup replay safe when the
/// persist step fails midway.
#[allow(clippy::too_many_arguments)]
pub fn set_forward(
    context: &Context,
    position: u32,
    action: &str,
    command: &str,
    source: &str,
    destination: &str,
    protocol: &str,
    port: &str,
    comment: &str,
    is_list: bool,
    except: bool,
) -> Result<(), ServerError> {
    let action = action.to_uppercase();

    match command {
        "write" => {
            if is_list {
                create_ipset_list(context, comment, &split_ips(destination))?;
                context.firewall.set_forward_list(
                    position, port, &action, command, source, comment, protocol, comment, except,
                )?;
            } else {
                context.firewall.set_forward(
                    position, port, &action, command, source, destination, protocol, comment,
                    except,
                )?;
            }
            Forward::create(
                &mut context.db.lock(),
                position,
                port,
                &action,
                source,
                destination,
                protocol,
                comment,
                is_list,
                except,
            )?;
            Ok(())
        }
        "delete" => {
            if is_list {
                context.firewall.set_forward_list(
                    position, port, &action, command, source, comment, protocol, comment, except,
                )?;
                delete_ipset_list(context, comment)?;
            } else {
                context.firewall.set_forward(
                    position, port, &action, command, source, destination, protocol, comment,
                    except,
                )?;
            }
            Forward::delete(&mut context.db.lock(), comment)?;
            Ok(())
        }
        other => Err(ServerError::invalid(format!("unknown command: {other}"))),
    }
}

/// Kernel rule first, then exactly one repository write per command.
pub fn set_masquerade(
    context: &Context,
    command: &str,
    source: &str,
    ifname: &str,
    comment: &str,
) -> Result<(), ServerError> {
    context
        .firewall
        .set_masquerade(command, source, ifname, comment)?;

    match command {
        "write" => Masquerade::create(&context.db.lock(), source, ifname, comment),
        "delete" => Masquerade::delete(&context.db.lock(), source, ifname, comment),
        other => Err(ServerError::invalid(format!("command did not find {other}"))),
    }
}

/// Byte counter of the FORWARD rule carrying `comment`, scraped from the
/// verbose listing; "none" when no line matches.
fn back_bytes(context: &Context, comment: &str) -> String {
    let out = match context.runner.run(
        "iptables",
        &["-t", "filter", "-L", "FORWARD", "-v", "-x", "-n", "--line-numbers"],
    ) {
        Ok(out) => out,
        Err(e) => {
            log::error!("back bytes: {e}");
            return "none".to_string();
        }
    };

    for line in out.text().lines() {
        if line.contains(comment) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() > 2 {
                return fields[2].to_string();
            }
        }
    }
    "none".to_string()
}

/// The persisted rule book augmented with live byte counters and the host's
/// non-loopback interfaces.
pub fn iptables_rules(context: &Context) -> Result<RulesReport, ServerError> {
    let forwards = match Forward::list(&context.db.lock()) {
        Ok(rules) => rules,
        Err(e) => {
            log::error!("get iptables rules: {e}");
            Vec::new()
        }
    };
    let masquerades = match Masquerade::list(&context.db.lock()) {
        Ok(rules) => rules,
        Err(e) => {
            log::error!("get iptables rules: {e}");
            Vec::new()
        }
    };

    let forward = forwards
        .into_iter()
        .map(|rule| ForwardReport {
            bytes: back_bytes(context, &rule.comment),
            source: rule.source,
            destination: rule.destination,
            protocol: rule.protocol,
            position: rule.position,
            action: rule.action,
            port: rule.port,
            comment: rule.comment,
            is_list: rule.is_list,
            except: rule.except,
        })
        .collect();

    let masquerade = masquerades
        .into_iter()
        .map(|rule| MasqueradeReport {
            ifname: rule.ifname,
            source: rule.source,
            comment: rule.comment,
        })
        .collect();

    Ok(RulesReport {
        forward,
        masquerade,
        interface_list: netif::non_loopback_names(context.netview.as_ref()),
    })
}

/// Boot-time replay: enable forwarding, flush the FORWARD chain, then
/// recreate every persisted rule in position order (ipsets included) and
/// every masquerade. Each failure is logged and skipped so one bad row
/// cannot prevent boot.
pub fn first_start_iptables(context: &Context) {
    match context.runner.run("sysctl", &["-w", "net.ipv4.ip_forward=1"]) {
        Ok(out) if !out.success => {
            log::error!("first start: sysctl: {}", out.text().trim())
        }
        Err(e) => log::error!("first start: sysctl: {e}"),
        _ => {}
    }

    if let Err(e) = context.firewall.flush_forward() {
        log::error!("first start: flush: {e}");
    }

    match Forward::list(&context.db.lock()) {
        Err(e) => log::error!("first start: {e}"),
        Ok(rules) => {
            for rule in rules {
                let replayed = if rule.is_list {
                    let members: Vec<String> =
                        rule.destination.split(',').map(str::to_string).collect();
                    create_ipset_list(context, &rule.comment, &members).and_then(|_| {
                        context.firewall.set_forward_list(
                            rule.position,
                            &rule.port,
                            &rule.action,
                            "write",
                            &rule.source,
                            &rule.comment,
                            &rule.protocol,
                            &rule.comment,
                            rule.except,
                        )
                    })
                } else {
                    context.firewall.set_forward(
                        rule.position,
                        &rule.port,
                        &rule.action,
                        "write",
                        &rule.source,
                        &rule.destination,
                        &rule.protocol,
                        &rule.comment,
                        rule.except,
                    )
                };
                if let Err(e) = replayed {
                    log::error!("first start: replay {}: {e}", rule.comment);
                }
            }
        }
    }

    match Masquerade::list(&context.db.lock()) {
        Err(e) => log::error!("first start: {e}"),
        Ok(rules) => {
            for rule in rules {
                if let Err(e) =
                    context
                        .firewall
                        .set_masquerade("write", &rule.source, &rule.ifname, &rule.comment)
                {
                    log::error!("first start: masquerade {}: {e}", rule.comment);
                }
            }
        }
    }
}
