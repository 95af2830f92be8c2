//! Health check system for monitoring component status.

use crate::record::TopicPartition;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Broker client component.
pub const COMPONENT_KAFKA: &str = "kafka";
/// Document store component.
pub const COMPONENT_STORE: &str = "store";
/// Group consumer component.
pub const COMPONENT_CONSUMER: &str = "consumer";

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// A partition stopped by a fatal processing outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct HaltedPartition {
    pub tp: TopicPartition,
    /// Offset of the record that could not be handled
    pub offset: i64,
    pub reason: String,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    consuming: RwLock<bool>,
    halted: RwLock<BTreeMap<TopicPartition, HaltedPartition>>,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            consuming: RwLock::new(false),
            halted: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a manager tracking the kafka, store and consumer components.
    pub fn for_consumer() -> Self {
        let health = Self::new();
        for name in [COMPONENT_KAFKA, COMPONENT_STORE, COMPONENT_CONSUMER] {
            health.register_component(name);
        }
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        let components = self.components.read();
        components.get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Mark the consumer loop as running.
    pub fn consumer_started(&self) {
        *self.consuming.write() = true;
    }

    /// Mark the consumer loop as stopped.
    pub fn consumer_stopped(&self) {
        *self.consuming.write() = false;
    }

    /// Check if the consumer loop is running.
    pub fn is_consuming(&self) -> bool {
        *self.consuming.read()
    }

    /// Record a halted partition and degrade the consumer component.
    pub fn partition_halted(&self, tp: &TopicPartition, offset: i64, reason: &str) {
        let mut halted = self.halted.write();
        halted.insert(
            tp.clone(),
            HaltedPartition {
                tp: tp.clone(),
                offset,
                reason: reason.to_string(),
            },
        );
        self.mark_degraded(COMPONENT_CONSUMER, &halted_summary(&halted));
    }

    /// Forget a partition once it left the assignment. The consumer turns
    /// healthy again when no halted partition remains.
    pub fn partition_released(&self, tp: &TopicPartition) {
        let mut halted = self.halted.write();
        if halted.remove(tp).is_none() {
            return;
        }
        if halted.is_empty() {
            let degraded = matches!(
                self.get_component_status(COMPONENT_CONSUMER),
                Some(ComponentStatus::Degraded(_))
            );
            if degraded {
                self.mark_healthy(COMPONENT_CONSUMER);
            }
        } else {
            self.mark_degraded(COMPONENT_CONSUMER, &halted_summary(&halted));
        }
    }

    /// Halted partitions in partition order.
    pub fn halted_partitions(&self) -> Vec<HaltedPartition> {
        self.halted.read().values().cloned().collect()
    }

    /// Ready when consuming and no component is unhealthy.
    pub fn is_ready(&self) -> bool {
        self.is_consuming() && self.is_operational()
    }
}

fn halted_summary(halted: &BTreeMap<TopicPartition, HaltedPartition>) -> String {
    let parts: Vec<String> = halted
        .values()
        .map(|p| format!("{} at offset {}", p.tp, p.offset))
        .collect();
    format!("halted partitions: {}", parts.join(", "))
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
