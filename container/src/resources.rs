use crate::error::ContainerError;
use crate::types::Resources;
use berth_core::units::ram_in_bytes;
use oci_spec::runtime::{LinuxDeviceCgroup, LinuxMemory, LinuxMemoryBuilder, LinuxResources, LinuxResourcesBuilder};

const UNLIMITED: i64 = -1;

fn parse_field(value: &str) -> Result<Option<i64>, ContainerError> {
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(ram_in_bytes(value)?))
}

/// Value to send for one field when moving from `prev` to `next`.
fn update_field(prev: &str, next: &str) -> Result<Option<i64>, ContainerError> {
    if next == prev {
        return parse_field(prev);
    }
    if next.is_empty() {
        return Ok(Some(UNLIMITED));
    }
    parse_field(next)
}

fn memory_block(
    limit: Option<i64>,
    reservation: Option<i64>,
    swap: Option<i64>,
) -> Result<Option<LinuxMemory>, ContainerError> {
    if limit.is_none() && reservation.is_none() && swap.is_none() {
        return Ok(None);
    }
    let mut builder = LinuxMemoryBuilder::default();
    if let Some(v) = limit {
        builder = builder.limit(v);
    }
    if let Some(v) = reservation {
        builder = builder.reservation(v);
    }
    if let Some(v) = swap {
        builder = builder.swap(v);
    }
    Ok(Some(builder.build()?))
}

/// Memory settings for a new container. Unset fields stay unset.
pub fn memory_limits(resources: &Resources) -> Result<Option<LinuxMemory>, ContainerError> {
    memory_block(
        parse_field(&resources.memory)?,
        parse_field(&resources.memory_reservation)?,
        parse_field(&resources.memory_swap)?,
    )
}

/// Resource block for updating a running task from `baseline` to
/// `requested`. Clearing a previously set field lifts the limit; the
/// current device rules are carried over unchanged.
pub fn update_resources(
    baseline: Option<&Resources>,
    requested: &Resources,
    devices: Vec<LinuxDeviceCgroup>,
) -> Result<LinuxResources, ContainerError> {
    let memory = match baseline {
        None => memory_limits(requested)?,
        Some(prev) => memory_block(
            update_field(&prev.memory, &requested.memory)?,
            update_field(&prev.memory_reservation, &requested.memory_reservation)?,
            update_field(&prev.memory_swap, &requested.memory_swap)?,
        )?,
    };

    let mut builder = LinuxResourcesBuilder::default().devices(devices);
    if let Some(memory) = memory {
        builder = builder.memory(memory);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::LinuxDeviceCgroupBuilder;

    fn deny_all() -> LinuxDeviceCgroup {
        LinuxDeviceCgroupBuilder::default()
            .allow(false)
            .access("rwm")
            .build()
            .unwrap()
    }

    #[test]
    fn test_only_set_fields() {
        let memory = memory_limits(&Resources {
            memory: "200M".to_string(),
            ..Default::default()
        })
        .unwrap()
        .unwrap();
        assert_eq!(memory.limit(), Some(200 * 1024 * 1024));
        assert_eq!(memory.reservation(), None);
        assert_eq!(memory.swap(), None);
        assert!(memory_limits(&Resources::default()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_size() {
        let err = memory_limits(&Resources {
            memory: "lots".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), berth_core::ErrorKind::Validation);
    }

    #[test]
    fn test_clearing_lifts_limit_and_keeps_devices() {
        let prev = Resources {
            memory: "200M".to_string(),
            ..Default::default()
        };
        let res = update_resources(Some(&prev), &Resources::default(), vec![deny_all()]).unwrap();
        assert_eq!(res.memory().as_ref().unwrap().limit(), Some(-1));
        assert_eq!(res.devices().as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_unchanged_fields_keep_value() {
        let prev = Resources {
            memory: "200M".to_string(),
            memory_reservation: "100M".to_string(),
            ..Default::default()
        };
        let next = Resources {
            memory: "300M".to_string(),
            memory_reservation: "100M".to_string(),
            ..Default::default()
        };
        let res = update_resources(Some(&prev), &next, vec![]).unwrap();
        let memory = res.memory().as_ref().unwrap();
        assert_eq!(memory.limit(), Some(300 * 1024 * 1024));
        assert_eq!(memory.reservation(), Some(100 * 1024 * 1024));
        assert_eq!(memory.swap(), None);
    }

    #[test]
    fn test_without_baseline_passes_through() {
        let next = Resources {
            memory_swap: "1G".to_string(),
            ..Default::default()
        };
        let res = update_resources(None, &next, vec![]).unwrap();
        let memory = res.memory().as_ref().unwrap();
        assert_eq!(memory.swap(), Some(1024 * 1024 * 1024));
        assert_eq!(memory.limit(), None);
    }
}
