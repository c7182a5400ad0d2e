//! Hub health evaluation
//!
//! - DEGRADED when the event store no longer accepts writes
//! - WARNING when circuits are open or a service has unmet hard dependencies
//! - HEALTHY otherwise

use hub_common::{HealthReport, HealthStatus, ServiceHealth};

/// Raw inputs of a health report
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub store_writable: bool,
    pub last_sequence: u64,
    pub queued_messages: u64,
    pub open_circuits: u32,
    pub services: Vec<ServiceHealth>,
}

pub fn evaluate(inputs: HealthInputs) -> HealthReport {
    let mut issues = Vec::new();
    let mut status = HealthStatus::Healthy;

    if inputs.open_circuits > 0 {
        issues.push(format!("{} circuit(s) open", inputs.open_circuits));
        status = HealthStatus::Warning;
    }
    for service in &inputs.services {
        if !service.unmet_dependencies.is_empty() {
            issues.push(format!(
                "{} is waiting on {}",
                service.service,
                service.unmet_dependencies.join(", ")
            ));
            status = HealthStatus::Warning;
        } else if service.healthy + service.degraded == 0 {
            issues.push(format!("{} has no healthy instance", service.service));
            status = HealthStatus::Warning;
        }
    }
    if !inputs.store_writable {
        issues.push("event store is not writable".to_string());
        status = HealthStatus::Degraded;
    }

    HealthReport {
        status,
        store_writable: inputs.store_writable,
        last_sequence: inputs.last_sequence,
        queued_messages: inputs.queued_messages,
        open_circuits: inputs.open_circuits,
        services: inputs.services,
        issues,
    }
}
