//! [`Hypervisor`] backend driving the `virsh` command line client

use super::hypervisor::Hypervisor;
use crate::error::{HypervisorError, QosError, Result};
use crate::models::{DomainEvent, DomainEventKind, DomainRef};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const VIRSH_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

/// stderr fragments meaning the domain went away under us
const DOMAIN_GONE_MESSAGES: &[&str] = &[
    "domain is not running",
    "Domain not found",
    "failed to get domain",
];

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Connection to a libvirt daemon through `virsh -c <uri>`
#[derive(Debug, Clone)]
pub struct VirshConnection {
    virsh: PathBuf,
    uri: String,
}

impl VirshConnection {
    /// Open the connection, verifying that the daemon answers
    pub async fn connect(virsh: &Path, uri: &str) -> Result<Self> {
        let conn = Self {
            virsh: virsh.to_path_buf(),
            uri: uri.to_string(),
        };
        let answered = conn.run(&["uri"], None).await?;
        info!(uri = %answered.trim(), "Connected to hypervisor");
        Ok(conn)
    }

    async fn run(&self, args: &[&str], domain: Option<&DomainRef>) -> Result<String> {
        let output = tokio::time::timeout(
            VIRSH_TIMEOUT,
            Command::new(&self.virsh)
                .arg("-c")
                .arg(&self.uri)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| QosError::Timeout {
            what: format!("virsh {}", args.join(" ")),
            timeout: VIRSH_TIMEOUT,
        })?
        .map_err(|e| {
            HypervisorError::Other(format!("failed to run {}: {}", self.virsh.display(), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, domain).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Hypervisor for VirshConnection {
    async fn list_active_domains(&self) -> Result<Vec<DomainRef>> {
        let output = self.run(&["list"], None).await?;
        let domains = parse_domain_list(&output);
        debug!(count = domains.len(), "Listed active domains");
        Ok(domains)
    }

    async fn descriptor_xml(&self, domain: &DomainRef) -> Result<String> {
        let id = domain.id.to_string();
        self.run(&["dumpxml", &id], Some(domain)).await
    }

    async fn cpu_time_per_core(&self, domain: &DomainRef) -> Result<Vec<u64>> {
        let id = domain.id.to_string();
        let output = self.run(&["cpu-stats", &id], Some(domain)).await?;
        parse_cpu_stats(&output).ok_or_else(|| {
            HypervisorError::Other(format!("unparsable cpu-stats output for {}", domain)).into()
        })
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<DomainEvent>> {
        let mut child = Command::new(&self.virsh)
            .arg("-c")
            .arg(&self.uri)
            .args(["event", "--all", "--loop"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::Other(format!("failed to start event stream: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HypervisorError::Other("event stream has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            // Keep the child alive for as long as events are consumed
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_event_line(&line) else {
                            continue;
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Hypervisor event stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Hypervisor event stream failed");
                        break;
                    }
                }
            }
        });

        info!("Subscribed to hypervisor lifecycle and device events");
        Ok(rx)
    }
}

fn classify_failure(stderr: &str, domain: Option<&DomainRef>) -> HypervisorError {
    match domain {
        Some(domain) if DOMAIN_GONE_MESSAGES.iter().any(|m| stderr.contains(m)) => {
            HypervisorError::DomainGone {
                domain: domain.to_string(),
            }
        }
        _ => HypervisorError::Other(stderr.trim().to_string()),
    }
}

/// Parse the `virsh list` table
fn parse_domain_list(output: &str) -> Vec<DomainRef> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            let name = fields.next()?;
            Some(DomainRef::new(id, name))
        })
        .collect()
}

/// Parse `virsh cpu-stats` into per-core nanoseconds
fn parse_cpu_stats(output: &str) -> Option<Vec<u64>> {
    let mut times = Vec::new();
    let mut current: Option<usize> = None;

    for line in output.lines().map(str::trim) {
        if let Some(cpu) = line.strip_prefix("CPU").and_then(|r| r.strip_suffix(':')) {
            let cpu: usize = cpu.parse().ok()?;
            if times.len() <= cpu {
                times.resize(cpu + 1, 0);
            }
            current = Some(cpu);
        } else if line.starts_with("Total:") {
            break;
        } else if let Some(rest) = line.strip_prefix("cpu_time") {
            let cpu = current?;
            let seconds = rest.split_whitespace().next()?;
            times[cpu] = seconds_to_ns(seconds)?;
        }
    }

    if times.is_empty() {
        None
    } else {
        Some(times)
    }
}

/// Convert a decimal seconds string to nanoseconds without going through floats
fn seconds_to_ns(value: &str) -> Option<u64> {
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    let whole: u64 = whole.parse().ok()?;
    let mut frac_ns = 0u64;
    for (i, digit) in frac.chars().take(9).enumerate() {
        let digit = digit.to_digit(10)? as u64;
        frac_ns += digit * 10u64.pow(8 - i as u32);
    }
    whole.checked_mul(NANOS_PER_SEC)?.checked_add(frac_ns)
}

/// Parse one `virsh event` line, e.g.
/// `event 'lifecycle' for domain 'vm1': Started Booted`
fn parse_event_line(line: &str) -> Option<DomainEvent> {
    let rest = line.trim().strip_prefix("event '")?;
    let (event_type, rest) = rest.split_once("' for domain '")?;
    let (domain, detail) = rest.split_once("': ")?;
    let detail = detail.trim();

    let kind = match event_type {
        "lifecycle" => match detail.split_whitespace().next()? {
            "Started" => DomainEventKind::Started,
            "Stopped" => DomainEventKind::Stopped,
            other => DomainEventKind::Lifecycle(other.to_string()),
        },
        "device-added" => DomainEventKind::DeviceAdded {
            alias: detail.to_string(),
        },
        "device-removed" => DomainEventKind::DeviceRemoved {
            alias: detail.to_string(),
        },
        _ => return None,
    };

    Some(DomainEvent {
        domain: domain.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_list() {
        let output = " Id   Name        State\n\
                      ----------------------------\n \
                      1    web-1       running\n \
                      7    batch-0     running\n\n";
        let domains = parse_domain_list(output);
        assert_eq!(
            domains,
            vec![DomainRef::new(1, "web-1"), DomainRef::new(7, "batch-0")]
        );

        let empty = " Id   Name   State\n--------------------\n\n";
        assert!(parse_domain_list(empty).is_empty());
    }

    #[test]
    fn test_parse_cpu_stats() {
        let output = "CPU0:\n\
                      \tcpu_time         1.500000000 seconds\n\
                      \tvcpu_time        1.200000000 seconds\n\
                      CPU1:\n\
                      \tcpu_time         0.000000123 seconds\n\
                      \tvcpu_time        0.000000000 seconds\n\
                      Total:\n\
                      \tcpu_time         9.000000000 seconds\n";
        assert_eq!(parse_cpu_stats(output), Some(vec![1_500_000_000, 123]));
        assert_eq!(parse_cpu_stats("error: nothing\n"), None);
    }

    #[test]
    fn test_seconds_to_ns() {
        assert_eq!(seconds_to_ns("2"), Some(2_000_000_000));
        assert_eq!(seconds_to_ns("0.5"), Some(500_000_000));
        assert_eq!(seconds_to_ns("12.000000001"), Some(12_000_000_001));
        assert_eq!(seconds_to_ns("x.1"), None);
    }

    #[test]
    fn test_parse_event_lines() {
        let started = parse_event_line("event 'lifecycle' for domain 'vm1': Started Booted").unwrap();
        assert_eq!(started.domain, "vm1");
        assert_eq!(started.kind, DomainEventKind::Started);

        let suspended =
            parse_event_line("event 'lifecycle' for domain 'vm1': Suspended Paused").unwrap();
        assert_eq!(
            suspended.kind,
            DomainEventKind::Lifecycle("Suspended".to_string())
        );

        let added = parse_event_line("event 'device-added' for domain 'vm2': vcpu4").unwrap();
        assert_eq!(
            added.kind,
            DomainEventKind::DeviceAdded {
                alias: "vcpu4".to_string()
            }
        );

        assert!(parse_event_line("event 'reboot' for domain 'vm1'").is_none());
        assert!(parse_event_line("events received: 4").is_none());
    }

    #[test]
    fn test_classify_failure() {
        let domain = DomainRef::new(3, "vm3");
        let gone = classify_failure("error: Requested operation is not valid: domain is not running", Some(&domain));
        assert!(matches!(gone, HypervisorError::DomainGone { .. }));

        let gone = classify_failure("error: failed to get domain '3'", Some(&domain));
        assert!(matches!(gone, HypervisorError::DomainGone { .. }));

        let other = classify_failure("error: failed to connect to the hypervisor", Some(&domain));
        assert!(matches!(other, HypervisorError::Other(_)));

        // Without a domain nothing can be gone
        let other = classify_failure("error: Domain not found", None);
        assert!(matches!(other, HypervisorError::Other(_)));
    }
}
