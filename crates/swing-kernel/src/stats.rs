//! Kernel counters and gauges.
//!
//! Consensus stats are persisted under `kernelStats` and feed the crank hash;
//! local stats live under `local.kernelStats` and may differ between nodes.

use indexmap::IndexMap;

use crate::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    /// Also tracks `<key>Up`, `<key>Down` and `<key>Max`.
    Gauge,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDefinition {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub metric_type: MetricType,
    pub consensus: bool,
}

impl MetricDefinition {
    const fn gauge(key: &'static str, name: &'static str, description: &'static str) -> Self {
        Self {
            key,
            name,
            description,
            metric_type: MetricType::Gauge,
            consensus: false,
        }
    }

    const fn consensus(self) -> Self {
        Self {
            consensus: true,
            ..self
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = vec![self.key.to_string()];
        if self.metric_type == MetricType::Gauge {
            for suffix in ["Up", "Down", "Max"] {
                keys.push(format!("{}{suffix}", self.key));
            }
        }
        keys
    }
}

pub const KERNEL_STATS_METRICS: &[MetricDefinition] = &[
    MetricDefinition::gauge(
        "runQueueLength",
        "swingset_run_queue_length",
        "Length of the kernel run queue",
    )
    .consensus(),
    MetricDefinition::gauge(
        "acceptanceQueueLength",
        "swingset_acceptance_queue_length",
        "Length of the kernel acceptance queue",
    )
    .consensus(),
    MetricDefinition::gauge(
        "promiseQueuesLength",
        "swingset_promise_queues_length",
        "Combined length of all kernel promise queues",
    )
    .consensus(),
    MetricDefinition::gauge(
        "kernelObjects",
        "swingset_kernel_objects",
        "Active kernel objects",
    ),
    MetricDefinition::gauge(
        "kernelDevices",
        "swingset_kernel_devices",
        "Active kernel devices",
    ),
    MetricDefinition::gauge(
        "kernelPromises",
        "swingset_kernel_promises",
        "Active kernel promises",
    ),
    MetricDefinition::gauge(
        "kpUnresolved",
        "swingset_unresolved_kernel_promises",
        "Unresolved kernel promises",
    ),
    MetricDefinition::gauge(
        "kpFulfilled",
        "swingset_fulfilled_kernel_promises",
        "Fulfilled kernel promises",
    ),
    MetricDefinition::gauge(
        "kpRejected",
        "swingset_rejected_kernel_promises",
        "Rejected kernel promises",
    ),
    MetricDefinition::gauge(
        "clistEntries",
        "swingset_clist_entries",
        "Number of entries in the kernel's c-list",
    ),
    MetricDefinition::gauge("vats", "swingset_vats", "Number of active vats"),
];

/// JSON-encoded stats as stored in the KV table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedStats {
    pub consensus_stats: String,
    pub local_stats: Option<String>,
}

type Tally = IndexMap<String, i64>;

#[derive(Debug, Clone)]
struct Tallies {
    consensus: Tally,
    local: Tally,
}

#[derive(Debug, Clone)]
pub struct KernelStats {
    definitions: &'static [MetricDefinition],
    tallies: Option<Tallies>,
}

impl KernelStats {
    pub fn new(definitions: &'static [MetricDefinition]) -> Self {
        Self {
            definitions,
            tallies: None,
        }
    }

    /// Reset every metric to zero.
    pub fn initialize_stats(&mut self) {
        let mut consensus = Tally::new();
        let mut local = Tally::new();
        for def in self.definitions {
            let target = if def.consensus {
                &mut consensus
            } else {
                &mut local
            };
            for key in def.keys() {
                target.insert(key, 0);
            }
        }
        self.tallies = Some(Tallies { consensus, local });
    }

    fn definition(&self, key: &str) -> KernelResult<&'static MetricDefinition> {
        self.definitions
            .iter()
            .find(|def| def.key == key)
            .ok_or_else(|| KernelError::UnknownStat(key.to_string()))
    }

    fn tally_mut(&mut self, def: &MetricDefinition) -> KernelResult<&mut Tally> {
        let tallies = self
            .tallies
            .as_mut()
            .ok_or(KernelError::StatsNotInitialized)?;
        Ok(if def.consensus {
            &mut tallies.consensus
        } else {
            &mut tallies.local
        })
    }

    pub fn inc_stat(&mut self, key: &str, delta: i64) -> KernelResult<()> {
        if self.tallies.is_none() {
            return Err(KernelError::StatsNotInitialized);
        }
        let def = self.definition(key)?;
        let tally = self.tally_mut(def)?;
        let value = tally.entry(key.to_string()).or_insert(0);
        *value += delta;
        let value = *value;
        if def.metric_type == MetricType::Gauge {
            *tally.entry(format!("{key}Up")).or_insert(0) += delta;
            let max = tally.entry(format!("{key}Max")).or_insert(0);
            if value > *max {
                *max = value;
            }
        }
        Ok(())
    }

    pub fn dec_stat(&mut self, key: &str, delta: i64) -> KernelResult<()> {
        if self.tallies.is_none() {
            return Err(KernelError::StatsNotInitialized);
        }
        let def = self.definition(key)?;
        if def.metric_type != MetricType::Gauge {
            return Err(KernelError::NotAGauge(key.to_string()));
        }
        let tally = self.tally_mut(def)?;
        *tally.entry(key.to_string()).or_insert(0) -= delta;
        *tally.entry(format!("{key}Down")).or_insert(0) += delta;
        Ok(())
    }

    /// All stats (local first, consensus values winning), or consensus only.
    pub fn get_stats(&self, consensus_only: bool) -> KernelResult<IndexMap<String, i64>> {
        let tallies = self
            .tallies
            .as_ref()
            .ok_or(KernelError::StatsNotInitialized)?;
        if consensus_only {
            return Ok(tallies.consensus.clone());
        }
        let mut all = tallies.local.clone();
        for (key, value) in &tallies.consensus {
            all.insert(key.clone(), *value);
        }
        Ok(all)
    }

    pub fn get_serialized_stats(&self) -> KernelResult<SerializedStats> {
        let tallies = self
            .tallies
            .as_ref()
            .ok_or(KernelError::StatsNotInitialized)?;
        Ok(SerializedStats {
            consensus_stats: serde_json::to_string(&tallies.consensus)?,
            local_stats: Some(serde_json::to_string(&tallies.local)?),
        })
    }

    /// Restore from a previous [`get_serialized_stats`](Self::get_serialized_stats).
    ///
    /// Consensus entries that are no longer defined are dropped. Unknown local
    /// entries are carried along untouched. A metric moved from consensus to
    /// local picks up its last consensus value.
    pub fn load_from_serialized_stats(&mut self, stats: &SerializedStats) -> KernelResult<()> {
        let consensus_in: Tally = serde_json::from_str(&stats.consensus_stats)?;
        let local_in: Tally = match &stats.local_stats {
            Some(text) => serde_json::from_str(text)?,
            None => Tally::new(),
        };

        let mut consensus = Tally::new();
        let mut local = local_in.clone();
        for def in self.definitions {
            for key in def.keys() {
                if def.consensus {
                    let value = consensus_in.get(&key).copied().unwrap_or(0);
                    consensus.insert(key, value);
                } else {
                    let value = consensus_in
                        .get(&key)
                        .or_else(|| local_in.get(&key))
                        .copied()
                        .unwrap_or(0);
                    local.insert(key, value);
                }
            }
        }
        let dropped = consensus_in
            .keys()
            .filter(|key| !consensus.contains_key(*key) && !local.contains_key(*key))
            .count();
        if dropped > 0 {
            log::warn!("dropped {dropped} unknown consensus stats on load");
        }
        self.tallies = Some(Tallies { consensus, local });
        Ok(())
    }
}
