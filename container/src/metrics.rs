//! Decoding of task metrics reported by cgroup v1 and v2 hosts.

use crate::error::ContainerError;
use crate::types::{ContainerMetrics, CpuMetrics, IoMetrics, MemoryMetrics};
use berth_supervisor::{TaskMetrics, from_timestamp};
use prost::Message;
use std::sync::OnceLock;

pub const CGROUP_V1_METRICS_TYPE: &str = "io.containerd.cgroups.v1.Metrics";
pub const CGROUP_V2_METRICS_TYPE: &str = "io.containerd.cgroups.v2.Metrics";

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const CLOCK_TICKS_PER_SECOND: u64 = 100;

pub mod v1 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Metrics {
        #[prost(message, optional, tag = "2")]
        pub pids: Option<PidsStat>,
        #[prost(message, optional, tag = "3")]
        pub cpu: Option<CpuStat>,
        #[prost(message, optional, tag = "4")]
        pub memory: Option<MemoryStat>,
        #[prost(message, optional, tag = "5")]
        pub blkio: Option<BlkIoStat>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PidsStat {
        #[prost(uint64, tag = "1")]
        pub current: u64,
        #[prost(uint64, tag = "2")]
        pub limit: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CpuStat {
        #[prost(message, optional, tag = "1")]
        pub usage: Option<CpuUsage>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CpuUsage {
        #[prost(uint64, tag = "1")]
        pub total: u64,
        #[prost(uint64, tag = "2")]
        pub kernel: u64,
        #[prost(uint64, tag = "3")]
        pub user: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct MemoryStat {
        #[prost(uint64, tag = "1")]
        pub cache: u64,
        #[prost(uint64, tag = "2")]
        pub rss: u64,
        #[prost(uint64, tag = "30")]
        pub total_inactive_file: u64,
        #[prost(message, optional, tag = "33")]
        pub usage: Option<MemoryEntry>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct MemoryEntry {
        #[prost(uint64, tag = "1")]
        pub limit: u64,
        #[prost(uint64, tag = "2")]
        pub usage: u64,
        #[prost(uint64, tag = "3")]
        pub max: u64,
        #[prost(uint64, tag = "4")]
        pub failcnt: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct BlkIoStat {
        #[prost(message, repeated, tag = "1")]
        pub io_service_bytes_recursive: Vec<BlkIoEntry>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct BlkIoEntry {
        #[prost(string, tag = "1")]
        pub op: String,
        #[prost(string, tag = "2")]
        pub device: String,
        #[prost(uint64, tag = "3")]
        pub major: u64,
        #[prost(uint64, tag = "4")]
        pub minor: u64,
        #[prost(uint64, tag = "5")]
        pub value: u64,
    }
}

pub mod v2 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Metrics {
        #[prost(message, optional, tag = "1")]
        pub pids: Option<PidsStat>,
        #[prost(message, optional, tag = "2")]
        pub cpu: Option<CpuStat>,
        #[prost(message, optional, tag = "4")]
        pub memory: Option<MemoryStat>,
        #[prost(message, optional, tag = "6")]
        pub io: Option<IoStat>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PidsStat {
        #[prost(uint64, tag = "1")]
        pub current: u64,
        #[prost(uint64, tag = "2")]
        pub limit: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CpuStat {
        #[prost(uint64, tag = "1")]
        pub usage_usec: u64,
        #[prost(uint64, tag = "2")]
        pub user_usec: u64,
        #[prost(uint64, tag = "3")]
        pub system_usec: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct MemoryStat {
        #[prost(uint64, tag = "1")]
        pub anon: u64,
        #[prost(uint64, tag = "2")]
        pub file: u64,
        #[prost(uint64, tag = "13")]
        pub inactive_file: u64,
        #[prost(uint64, tag = "32")]
        pub usage: u64,
        #[prost(uint64, tag = "33")]
        pub usage_limit: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct IoStat {
        #[prost(message, repeated, tag = "1")]
        pub usage: Vec<IoEntry>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct IoEntry {
        #[prost(uint64, tag = "1")]
        pub major: u64,
        #[prost(uint64, tag = "2")]
        pub minor: u64,
        #[prost(uint64, tag = "3")]
        pub rbytes: u64,
        #[prost(uint64, tag = "4")]
        pub wbytes: u64,
    }
}

static MACHINE_MEMORY: OnceLock<u64> = OnceLock::new();

/// Total memory of the host in bytes, read once per process.
pub fn machine_memory() -> u64 {
    *MACHINE_MEMORY.get_or_init(|| {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.total_memory()
    })
}

/// Aggregate CPU time of the host from `/proc/stat`, in nanoseconds.
pub async fn system_cpu_usage() -> Option<u64> {
    let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_system_cpu(&stat)
}

fn parse_system_cpu(stat: &str) -> Option<u64> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let ticks: u64 = line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|f| f.parse::<u64>().ok())
        .fold(0u64, u64::saturating_add);
    Some(ticks.saturating_mul(NANOS_PER_SECOND / CLOCK_TICKS_PER_SECOND))
}

fn memory_total(limit: u64) -> u64 {
    limit.min(machine_memory())
}

/// Decodes `metrics` into per-category figures.
pub fn decode(
    metrics: &TaskMetrics,
    system_total_ns: Option<u64>,
) -> Result<ContainerMetrics, ContainerError> {
    let data = metrics
        .data
        .as_ref()
        .ok_or_else(|| ContainerError::UnexpectedMetrics(String::new()))?;
    let timestamp = from_timestamp(&metrics.timestamp);

    if data.type_url.ends_with(CGROUP_V1_METRICS_TYPE) {
        let m = v1::Metrics::decode(data.value.as_slice())?;
        Ok(ContainerMetrics {
            cpu: m.cpu.and_then(|c| c.usage).map(|u| CpuMetrics {
                used_ns: u.total,
                system_total_ns,
            }),
            memory: m.memory.and_then(|mem| {
                mem.usage.map(|u| MemoryMetrics {
                    used: u.usage.saturating_sub(mem.total_inactive_file),
                    total: memory_total(u.limit),
                })
            }),
            io: m.blkio.map(|b| {
                let mut io = IoMetrics::default();
                for entry in b.io_service_bytes_recursive {
                    if entry.op.eq_ignore_ascii_case("read") {
                        io.read_bytes += entry.value;
                    } else if entry.op.eq_ignore_ascii_case("write") {
                        io.write_bytes += entry.value;
                    }
                }
                io
            }),
            pids: m.pids.map(|p| p.current),
            timestamp,
        })
    } else if data.type_url.ends_with(CGROUP_V2_METRICS_TYPE) {
        let m = v2::Metrics::decode(data.value.as_slice())?;
        Ok(ContainerMetrics {
            cpu: m.cpu.map(|c| CpuMetrics {
                used_ns: c.usage_usec * 1000,
                system_total_ns,
            }),
            memory: m.memory.map(|mem| MemoryMetrics {
                used: mem.usage.saturating_sub(mem.inactive_file),
                total: memory_total(mem.usage_limit),
            }),
            io: m.io.map(|s| IoMetrics {
                read_bytes: s.usage.iter().map(|e| e.rbytes).sum(),
                write_bytes: s.usage.iter().map(|e| e.wbytes).sum(),
            }),
            pids: m.pids.map(|p| p.current),
            timestamp,
        })
    } else {
        Err(ContainerError::UnexpectedMetrics(data.type_url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_supervisor::now_timestamp;
    use prost_types::Any;

    fn task_metrics(type_url: &str, value: Vec<u8>) -> TaskMetrics {
        TaskMetrics {
            timestamp: now_timestamp(),
            id: "c1".to_string(),
            data: Some(Any {
                type_url: type_url.to_string(),
                value,
            }),
        }
    }

    #[test]
    fn test_cgroup_v1() {
        let m = v1::Metrics {
            pids: Some(v1::PidsStat {
                current: 3,
                limit: 0,
            }),
            cpu: Some(v1::CpuStat {
                usage: Some(v1::CpuUsage {
                    total: 5_000,
                    kernel: 1_000,
                    user: 4_000,
                }),
            }),
            memory: Some(v1::MemoryStat {
                total_inactive_file: 100,
                usage: Some(v1::MemoryEntry {
                    limit: 1024,
                    usage: 600,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            blkio: Some(v1::BlkIoStat {
                io_service_bytes_recursive: vec![
                    v1::BlkIoEntry {
                        op: "Read".to_string(),
                        value: 10,
                        ..Default::default()
                    },
                    v1::BlkIoEntry {
                        op: "Write".to_string(),
                        value: 20,
                        ..Default::default()
                    },
                    v1::BlkIoEntry {
                        op: "Total".to_string(),
                        value: 30,
                        ..Default::default()
                    },
                    v1::BlkIoEntry {
                        op: "Read".to_string(),
                        value: 5,
                        ..Default::default()
                    },
                ],
            }),
        };
        let got = decode(
            &task_metrics(CGROUP_V1_METRICS_TYPE, m.encode_to_vec()),
            Some(42),
        )
        .unwrap();
        assert_eq!(
            got.cpu,
            Some(CpuMetrics {
                used_ns: 5_000,
                system_total_ns: Some(42)
            })
        );
        assert_eq!(got.memory, Some(MemoryMetrics { used: 500, total: 1024 }));
        assert_eq!(
            got.io,
            Some(IoMetrics {
                read_bytes: 15,
                write_bytes: 20
            })
        );
        assert_eq!(got.pids, Some(3));
    }

    #[test]
    fn test_cgroup_v2_unlimited_memory_uses_machine_memory() {
        let m = v2::Metrics {
            cpu: Some(v2::CpuStat {
                usage_usec: 7,
                ..Default::default()
            }),
            memory: Some(v2::MemoryStat {
                usage: 2048,
                inactive_file: 48,
                usage_limit: u64::MAX,
                ..Default::default()
            }),
            io: Some(v2::IoStat {
                usage: vec![
                    v2::IoEntry {
                        rbytes: 1,
                        wbytes: 2,
                        ..Default::default()
                    },
                    v2::IoEntry {
                        rbytes: 3,
                        wbytes: 4,
                        ..Default::default()
                    },
                ],
            }),
            pids: None,
        };
        let got = decode(
            &task_metrics(
                &format!("types.googleapis.com/{}", CGROUP_V2_METRICS_TYPE),
                m.encode_to_vec(),
            ),
            None,
        )
        .unwrap();
        assert_eq!(got.cpu.unwrap().used_ns, 7_000);
        let memory = got.memory.unwrap();
        assert_eq!(memory.used, 2000);
        assert_eq!(memory.total, machine_memory());
        assert_eq!(
            got.io,
            Some(IoMetrics {
                read_bytes: 4,
                write_bytes: 6
            })
        );
        assert_eq!(got.pids, None);
    }

    #[test]
    fn test_missing_sections_are_none() {
        let m = v2::Metrics {
            pids: Some(v2::PidsStat {
                current: 1,
                limit: 10,
            }),
            ..Default::default()
        };
        let got = decode(&task_metrics(CGROUP_V2_METRICS_TYPE, m.encode_to_vec()), None).unwrap();
        assert!(got.cpu.is_none());
        assert!(got.memory.is_none());
        assert!(got.io.is_none());
        assert_eq!(got.pids, Some(1));
    }

    #[test]
    fn test_unknown_type() {
        let err = decode(&task_metrics("io.example.Metrics", vec![]), None).unwrap_err();
        assert!(matches!(err, ContainerError::UnexpectedMetrics(ref t) if t == "io.example.Metrics"));
    }

    #[test]
    fn test_machine_memory_stable() {
        let first = machine_memory();
        let handles: Vec<_> = (0..4).map(|_| std::thread::spawn(machine_memory)).collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), first);
        }
    }

    #[test]
    fn test_parse_system_cpu() {
        let stat = "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 50 0 50 400 0 0 0 0 0 0\n";
        assert_eq!(parse_system_cpu(stat), Some(1000 * 10_000_000));
    }

    #[test]
    fn test_parse_system_cpu_long_uptime() {
        // A many-core host after months of uptime.
        let stat = "cpu  2000000000 0 1000000000 16400000000 0 0 0 0 0 0\n";
        assert_eq!(parse_system_cpu(stat), Some(19_400_000_000 * 10_000_000));

        let stat = format!("cpu  {} {} 0 0 0 0 0\n", u64::MAX, u64::MAX);
        assert_eq!(parse_system_cpu(&stat), Some(u64::MAX));
    }
}
