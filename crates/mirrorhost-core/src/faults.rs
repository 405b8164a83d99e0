//! Synthetic fault injection for replayed values.
//!
//! A small allow-list of item-key categories (CPU, ping, temperature,
//! interface status/speed) can be pushed into a "problem" for a few ticks
//! so the destination's triggers have something to fire on. Each
//! (host, key) pair moves through a tiny state machine:
//!
//! ```text
//! Idle --(r < probability)--> Active(duration - 1)   fault value
//! Active(n > 0)           --> Active(n - 1)         fault value
//! Active(0)               --> Idle                  original value
//! ```
//!
//! The active-problem table belongs to one [`FaultInjector`], shared by all
//! ticks of a replay engine.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::FaultConfig;
use crate::model::MetricValue;

/// Item categories that participate in fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    CpuUtilization,
    PingAvailability,
    PingLoss,
    PingLatency,
    Temperature,
    LinkStatus,
    InterfaceSpeed,
}

impl FaultKind {
    /// Classify an item key; `None` means the key passes through untouched.
    #[must_use]
    pub fn classify(key: &str) -> Option<Self> {
        if key.contains("cpu.util") {
            Some(Self::CpuUtilization)
        } else if key.contains("icmpping") && !key.contains("loss") && !key.contains("sec") {
            Some(Self::PingAvailability)
        } else if key.contains("icmppingloss") {
            Some(Self::PingLoss)
        } else if key.contains("icmppingsec") {
            Some(Self::PingLatency)
        } else if key.to_lowercase().contains("sensor.temp") {
            Some(Self::Temperature)
        } else if key.contains("ifOperStatus") {
            Some(Self::LinkStatus)
        } else if key.contains("ifSpeed") {
            Some(Self::InterfaceSpeed)
        } else {
            None
        }
    }

    /// Draw a value that looks like a problem for this category.
    pub fn fault_value<R: Rng + ?Sized>(self, rng: &mut R) -> MetricValue {
        match self {
            Self::CpuUtilization => MetricValue::Float(rng.random_range(85.0..=99.0)),
            Self::PingAvailability => MetricValue::Integer(0),
            Self::PingLoss => MetricValue::Float(rng.random_range(25.0..=75.0)),
            Self::PingLatency => MetricValue::Float(rng.random_range(0.2..=1.0)),
            Self::Temperature => MetricValue::Float(rng.random_range(55.0..=80.0)),
            // ifOperStatus 2 = down
            Self::LinkStatus => MetricValue::Integer(2),
            Self::InterfaceSpeed => MetricValue::Float(rng.random_range(0.0..=1_000_000_000.0)),
        }
    }
}

struct FaultState {
    active: HashMap<(String, String), u32>,
    rng: StdRng,
}

/// Stateful fault injector.
pub struct FaultInjector {
    enabled: bool,
    probability: f64,
    min_ticks: u32,
    max_ticks: u32,
    state: Mutex<FaultState>,
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("enabled", &self.enabled)
            .field("probability", &self.probability)
            .field("min_ticks", &self.min_ticks)
            .field("max_ticks", &self.max_ticks)
            .field("active", &self.active_count())
            .finish()
    }
}

impl FaultInjector {
    #[must_use]
    pub fn new(config: &FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let min_ticks = config.min_ticks.max(1);
        Self {
            enabled: config.enabled,
            probability: config.probability.clamp(0.0, 1.0),
            min_ticks,
            max_ticks: config.max_ticks.max(min_ticks),
            state: Mutex::new(FaultState {
                active: HashMap::new(),
                rng,
            }),
        }
    }

    /// An injector that never alters values.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&FaultConfig {
            enabled: false,
            ..FaultConfig::default()
        })
    }

    /// Pass a value through the injector, possibly replacing it with a fault value.
    pub fn inject(&self, host_id: &str, item_key: &str, value: MetricValue) -> MetricValue {
        if !self.enabled {
            return value;
        }
        let Some(kind) = FaultKind::classify(item_key) else {
            return value;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let FaultState { active, rng } = &mut *state;
        let problem_key = (host_id.to_string(), item_key.to_string());

        match active.get_mut(&problem_key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!(host_id, item_key, remaining = *remaining, "Continuing simulated problem");
                kind.fault_value(rng)
            }
            Some(_) => {
                active.remove(&problem_key);
                debug!(host_id, item_key, "Simulated problem ended");
                value
            }
            None => {
                if rng.random::<f64>() < self.probability {
                    let duration = rng.random_range(self.min_ticks..=self.max_ticks);
                    active.insert(problem_key, duration - 1);
                    debug!(host_id, item_key, duration, ?kind, "Simulating new problem");
                    kind.fault_value(rng)
                } else {
                    value
                }
            }
        }
    }

    /// Remaining countdown of an active problem.
    #[must_use]
    pub fn active_countdown(&self, host_id: &str, item_key: &str) -> Option<u32> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .active
            .get(&(host_id.to_string(), item_key.to_string()))
            .copied()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_faulting(ticks: u32) -> FaultInjector {
        FaultInjector::new(&FaultConfig {
            enabled: true,
            probability: 1.0,
            min_ticks: ticks,
            max_ticks: ticks,
            seed: Some(7),
        })
    }

    #[test]
    fn classification_follows_key_substrings() {
        assert_eq!(
            FaultKind::classify("system.cpu.util[,idle]"),
            Some(FaultKind::CpuUtilization)
        );
        assert_eq!(FaultKind::classify("icmpping"), Some(FaultKind::PingAvailability));
        assert_eq!(FaultKind::classify("icmppingloss"), Some(FaultKind::PingLoss));
        assert_eq!(FaultKind::classify("icmppingsec"), Some(FaultKind::PingLatency));
        assert_eq!(
            FaultKind::classify("Sensor.Temp[cpu0]"),
            Some(FaultKind::Temperature)
        );
        assert_eq!(
            FaultKind::classify("net.if.ifOperStatus[eth0]"),
            Some(FaultKind::LinkStatus)
        );
        assert_eq!(FaultKind::classify("ifSpeed[2]"), Some(FaultKind::InterfaceSpeed));
        assert_eq!(FaultKind::classify("vm.memory.size"), None);
        assert_eq!(FaultKind::classify("agent.ping"), None);
    }

    #[test]
    fn fault_values_stay_in_category_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let MetricValue::Float(cpu) = FaultKind::CpuUtilization.fault_value(&mut rng) else {
                panic!("cpu fault must be float");
            };
            assert!((85.0..=99.0).contains(&cpu));
            let MetricValue::Float(loss) = FaultKind::PingLoss.fault_value(&mut rng) else {
                panic!("loss fault must be float");
            };
            assert!((25.0..=75.0).contains(&loss));
            let MetricValue::Float(latency) = FaultKind::PingLatency.fault_value(&mut rng) else {
                panic!("latency fault must be float");
            };
            assert!((0.2..=1.0).contains(&latency));
            let MetricValue::Float(temp) = FaultKind::Temperature.fault_value(&mut rng) else {
                panic!("temperature fault must be float");
            };
            assert!((55.0..=80.0).contains(&temp));
        }
        assert_eq!(
            FaultKind::PingAvailability.fault_value(&mut rng),
            MetricValue::Integer(0)
        );
        assert_eq!(
            FaultKind::LinkStatus.fault_value(&mut rng),
            MetricValue::Integer(2)
        );
    }

    #[test]
    fn non_participating_keys_pass_through() {
        let injector = always_faulting(3);
        let value = MetricValue::Integer(42);
        assert_eq!(injector.inject("h", "vm.memory.size", value.clone()), value);
        assert_eq!(injector.active_count(), 0);
    }

    #[test]
    fn problem_lasts_exactly_the_drawn_duration() {
        let injector = always_faulting(3);
        let original = MetricValue::Integer(1);

        // Tick 1 starts the problem with countdown 2.
        assert_ne!(injector.inject("h", "icmpping", original.clone()), original);
        assert_eq!(injector.active_countdown("h", "icmpping"), Some(2));
        // Ticks 2 and 3 continue it.
        assert_eq!(injector.inject("h", "icmpping", original.clone()), MetricValue::Integer(0));
        assert_eq!(injector.inject("h", "icmpping", original.clone()), MetricValue::Integer(0));
        assert_eq!(injector.active_countdown("h", "icmpping"), Some(0));
        // Tick 4 is the recovery tick.
        assert_eq!(injector.inject("h", "icmpping", original.clone()), original);
        assert_eq!(injector.active_countdown("h", "icmpping"), None);
    }

    #[test]
    fn problems_are_tracked_per_host_and_key() {
        let injector = always_faulting(2);
        injector.inject("a", "icmpping", MetricValue::Integer(1));
        injector.inject("b", "icmpping", MetricValue::Integer(1));
        injector.inject("a", "ifOperStatus", MetricValue::Integer(1));
        assert_eq!(injector.active_count(), 3);
    }

    #[test]
    fn zero_probability_never_faults() {
        let injector = FaultInjector::new(&FaultConfig {
            probability: 0.0,
            ..FaultConfig::default()
        });
        for _ in 0..100 {
            assert_eq!(
                injector.inject("h", "system.cpu.util", MetricValue::Float(3.0)),
                MetricValue::Float(3.0)
            );
        }
        assert_eq!(injector.active_count(), 0);
    }

    #[test]
    fn disabled_injector_is_identity() {
        let injector = FaultInjector::disabled();
        assert_eq!(
            injector.inject("h", "icmpping", MetricValue::Integer(1)),
            MetricValue::Integer(1)
        );
    }
}
