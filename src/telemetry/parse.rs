//! Parsers for the remote diagnostic commands.
//!
//! Each parser takes the raw stdout of one command and returns `None` when
//! the output does not look like what the command normally prints. Callers
//! skip the metric for that tick and keep going.

/// `top -bn1`, the `%Cpu(s)` summary line. Returns busy percent.
pub fn cpu_percent(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("Cpu(s)"))?;
    // "%Cpu(s):  1.2 us, ... 97.8 id, ..."
    let idle_pos = line.find(" id")?;
    let head = &line[..idle_pos];
    let idle: f64 = head
        .rsplit([' ', ','])
        .find(|tok| !tok.is_empty())?
        .parse()
        .ok()?;
    if !(0.0..=100.0).contains(&idle) {
        return None;
    }
    Some(((100.0 - idle) * 10.0).round() / 10.0)
}

#[derive(Debug, PartialEq, Eq)]
pub struct MemUsage {
    pub mem_total: u64,
    pub mem_used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

/// `free -b`. Needs both the `Mem:` and `Swap:` rows.
pub fn mem_usage(output: &str) -> Option<MemUsage> {
    let mut mem = None;
    let mut swap = None;
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("Mem:") => {
                let total = fields.next()?.parse().ok()?;
                let used = fields.next()?.parse().ok()?;
                mem = Some((total, used));
            }
            Some("Swap:") => {
                let total = fields.next()?.parse().ok()?;
                let used = fields.next()?.parse().ok()?;
                swap = Some((total, used));
            }
            _ => {}
        }
    }
    let (mem_total, mem_used) = mem?;
    let (swap_total, swap_used) = swap?;
    Some(MemUsage {
        mem_total,
        mem_used,
        swap_total,
        swap_used,
    })
}

#[derive(Debug, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: u8,
}

/// `df -kP /`, POSIX format: one header line then the root filesystem row.
pub fn disk_usage(output: &str) -> Option<DiskUsage> {
    let row = output.lines().nth(1)?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let total_kb: u64 = fields[1].parse().ok()?;
    let used_kb: u64 = fields[2].parse().ok()?;
    let used_percent: u8 = fields[4].trim_end_matches('%').parse().ok()?;
    Some(DiskUsage {
        total_bytes: total_kb * 1024,
        used_bytes: used_kb * 1024,
        used_percent,
    })
}

/// `cat /etc/os-release`, falling back to the first non-empty line when
/// the `PRETTY_NAME` field is missing (e.g. `uname` output).
pub fn os_name(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
            let name = value.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    let first = output.lines().find(|l| !l.trim().is_empty())?;
    Some(first.trim().to_string())
}

#[derive(Debug, PartialEq, Eq)]
pub struct NetCounters {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// `cat /proc/net/dev`. Picks the busiest non-loopback interface, which is
/// the default route's interface on any box that is actually talking.
pub fn net_counters(output: &str) -> Option<NetCounters> {
    let mut best: Option<NetCounters> = None;
    for line in output.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let (Ok(rx_bytes), Ok(tx_bytes)) = (fields[0].parse::<u64>(), fields[8].parse::<u64>())
        else {
            continue;
        };
        let better = best
            .as_ref()
            .is_none_or(|b| rx_bytes + tx_bytes > b.rx_bytes + b.tx_bytes);
        if better {
            best = Some(NetCounters {
                interface: name.to_string(),
                rx_bytes,
                tx_bytes,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_line_is_parsed() {
        let out = "top - 12:00:01 up 1 day\n\
                   %Cpu(s):  1.2 us,  0.4 sy,  0.0 ni, 97.8 id,  0.5 wa,  0.0 hi,  0.1 si,  0.0 st\n";
        assert_eq!(cpu_percent(out), Some(2.2));
    }

    #[test]
    fn cpu_garbage_is_rejected() {
        assert_eq!(cpu_percent("command not found"), None);
        assert_eq!(cpu_percent("%Cpu(s): lots id"), None);
    }

    #[test]
    fn free_output_is_parsed() {
        let out = "              total        used        free\n\
                   Mem:     8217579520  3124848640  1073741824\n\
                   Swap:    2147483648   536870912  1610612736\n";
        assert_eq!(
            mem_usage(out),
            Some(MemUsage {
                mem_total: 8_217_579_520,
                mem_used: 3_124_848_640,
                swap_total: 2_147_483_648,
                swap_used: 536_870_912,
            })
        );
    }

    #[test]
    fn free_without_swap_row_is_rejected() {
        let out = "Mem: 100 50 50\n";
        assert_eq!(mem_usage(out), None);
    }

    #[test]
    fn df_output_is_parsed() {
        let out = "Filesystem 1024-blocks    Used Available Capacity Mounted on\n\
                   /dev/vda1     41152832 9692160  29551232      25% /\n";
        assert_eq!(
            disk_usage(out),
            Some(DiskUsage {
                total_bytes: 41_152_832 * 1024,
                used_bytes: 9_692_160 * 1024,
                used_percent: 25,
            })
        );
    }

    #[test]
    fn os_release_pretty_name_wins() {
        let out = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n";
        assert_eq!(os_name(out).as_deref(), Some("Debian GNU/Linux 12 (bookworm)"));
        assert_eq!(os_name("Linux host 6.1.0\n").as_deref(), Some("Linux host 6.1.0"));
    }

    #[test]
    fn busiest_interface_is_selected() {
        let out = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 9999999    1000    0    0    0     0          0         0  9999999    1000    0    0    0     0       0          0\n\
  eth0: 1000000     500    0    0    0     0          0         0   200000     300    0    0    0     0       0          0\n\
  eth1:    5000      10    0    0    0     0          0         0     1000       5    0    0    0     0       0          0\n";
        let counters = net_counters(out).unwrap();
        assert_eq!(counters.interface, "eth0");
        assert_eq!(counters.rx_bytes, 1_000_000);
        assert_eq!(counters.tx_bytes, 200_000);
    }

    #[test]
    fn proc_net_dev_without_interfaces_is_rejected() {
        let out = "Inter-| Receive\n face |bytes\n";
        assert_eq!(net_counters(out), None);
    }
}
