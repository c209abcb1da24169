//! The kernel promise table.
//!
//! An unresolved promise `kpN` keeps `state`, `refCount`, `decider`,
//! `subscribers`, an optional `policy`, and a message queue under
//! `kpN.queue.<i>` with its own `kpN.queue.nextID`. Resolution replaces all
//! of that with `data.body` and `data.slots`.

use std::{collections::BTreeSet, str::FromStr};

use swing_store::{KvStore, helpers};

use crate::slots::{KernelSlot, SlotType, insist_vat_id};
use crate::{CapData, KernelError, KernelKeeper, KernelResult, Message, RefCountOptions, RunQueueEvent};

/// What the kernel does when a promise is rejected and nobody is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromisePolicy {
    #[default]
    Ignore,
    LogAlways,
    LogFailure,
    Panic,
}

impl PromisePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PromisePolicy::Ignore => "ignore",
            PromisePolicy::LogAlways => "logAlways",
            PromisePolicy::LogFailure => "logFailure",
            PromisePolicy::Panic => "panic",
        }
    }
}

impl FromStr for PromisePolicy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(PromisePolicy::Ignore),
            "logAlways" => Ok(PromisePolicy::LogAlways),
            "logFailure" => Ok(PromisePolicy::LogFailure),
            "panic" => Ok(PromisePolicy::Panic),
            other => Err(KernelError::Corrupt(format!("unknown promise policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelPromise {
    Unresolved {
        ref_count: u64,
        decider: Option<String>,
        policy: PromisePolicy,
        subscribers: Vec<String>,
        queue: Vec<Message>,
    },
    Fulfilled {
        ref_count: u64,
        data: CapData,
    },
    Rejected {
        ref_count: u64,
        data: CapData,
    },
}

impl KernelPromise {
    pub fn ref_count(&self) -> u64 {
        match self {
            KernelPromise::Unresolved { ref_count, .. }
            | KernelPromise::Fulfilled { ref_count, .. }
            | KernelPromise::Rejected { ref_count, .. } => *ref_count,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            KernelPromise::Unresolved { .. } => "unresolved",
            KernelPromise::Fulfilled { .. } => "fulfilled",
            KernelPromise::Rejected { .. } => "rejected",
        }
    }
}

fn state_stat(state: &str) -> KernelResult<&'static str> {
    match state {
        "unresolved" => Ok("kpUnresolved"),
        "fulfilled" => Ok("kpFulfilled"),
        "rejected" => Ok("kpRejected"),
        other => Err(KernelError::Corrupt(format!("unknown promise state '{other}'"))),
    }
}

fn state_name(state: &str) -> &'static str {
    match state {
        "fulfilled" => "fulfilled",
        "rejected" => "rejected",
        _ => "unresolved",
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl KernelKeeper {
    pub fn add_kernel_promise(&mut self, policy: PromisePolicy) -> KernelResult<String> {
        let id = self.allocate_id("kp.nextID")?;
        let kpid = KernelSlot::new(SlotType::Promise, id).to_string();
        let kv = self.kv();
        kv.set(&format!("{kpid}.state"), "unresolved")?;
        kv.set(&format!("{kpid}.subscribers"), "")?;
        kv.set(&format!("{kpid}.queue.nextID"), "0")?;
        kv.set(&format!("{kpid}.refCount"), "0")?;
        kv.set(&format!("{kpid}.decider"), "")?;
        if policy != PromisePolicy::Ignore {
            kv.set(&format!("{kpid}.policy"), policy.as_str())?;
        }
        self.inc_stat("kernelPromises")?;
        self.inc_stat("kpUnresolved")?;
        Ok(kpid)
    }

    /// A promise whose decider is the vat that created it.
    pub fn add_kernel_promise_for_vat(&mut self, decider_vat_id: &str) -> KernelResult<String> {
        insist_vat_id(decider_vat_id)?;
        let kpid = self.add_kernel_promise(PromisePolicy::Ignore)?;
        self.kv().set(&format!("{kpid}.decider"), decider_vat_id)?;
        Ok(kpid)
    }

    pub fn has_kernel_promise(&self, kpid: &str) -> KernelResult<bool> {
        KernelSlot::parse_as(kpid, SlotType::Promise)?;
        Ok(self.kv().has(&format!("{kpid}.state"))?)
    }

    fn promise_state(&self, kpid: &str) -> KernelResult<String> {
        KernelSlot::parse_as(kpid, SlotType::Promise)?;
        self.kv()
            .get(&format!("{kpid}.state"))?
            .ok_or_else(|| KernelError::UnknownPromise(kpid.to_string()))
    }

    fn insist_unresolved(&self, kpid: &str) -> KernelResult<()> {
        let state = self.promise_state(kpid)?;
        if state != "unresolved" {
            return Err(KernelError::PromiseNotUnresolved {
                kpid: kpid.to_string(),
                state: state_name(&state),
            });
        }
        Ok(())
    }

    pub fn get_kernel_promise(&self, kpid: &str) -> KernelResult<KernelPromise> {
        let state = self.promise_state(kpid)?;
        let ref_count = self.get_u64(&format!("{kpid}.refCount"))?;
        if state == "unresolved" {
            let decider = self.get_required(&format!("{kpid}.decider"))?;
            let policy = match self.kv().get(&format!("{kpid}.policy"))? {
                Some(raw) => raw.parse()?,
                None => PromisePolicy::Ignore,
            };
            let queue = helpers::get_prefixed_values(self.kv(), &format!("{kpid}.queue."))?
                .iter()
                .map(|raw| serde_json::from_str(raw))
                .collect::<Result<_, _>>()?;
            return Ok(KernelPromise::Unresolved {
                ref_count,
                decider: (!decider.is_empty()).then_some(decider),
                policy,
                subscribers: split_list(&self.get_required(&format!("{kpid}.subscribers"))?),
                queue,
            });
        }
        let data = CapData {
            body: self.get_required(&format!("{kpid}.data.body"))?,
            slots: split_list(&self.get_required(&format!("{kpid}.data.slots"))?),
        };
        match state.as_str() {
            "fulfilled" => Ok(KernelPromise::Fulfilled { ref_count, data }),
            "rejected" => Ok(KernelPromise::Rejected { ref_count, data }),
            other => Err(KernelError::Corrupt(format!(
                "{kpid} has unknown state '{other}'"
            ))),
        }
    }

    pub fn add_subscriber_to_promise(&self, kpid: &str, vat_id: &str) -> KernelResult<()> {
        insist_vat_id(vat_id)?;
        self.insist_unresolved(kpid)?;
        let key = format!("{kpid}.subscribers");
        let mut subscribers: BTreeSet<String> =
            split_list(&self.get_required(&key)?).into_iter().collect();
        subscribers.insert(vat_id.to_string());
        let joined = subscribers.into_iter().collect::<Vec<_>>().join(",");
        Ok(self.kv().set(&key, &joined)?)
    }

    /// Park a message on an unresolved promise until it settles.
    pub fn add_message_to_promise_queue(&mut self, kpid: &str, msg: &Message) -> KernelResult<()> {
        self.insist_unresolved(kpid)?;
        let index = self.allocate_id(&format!("{kpid}.queue.nextID"))?;
        self.set_json(&format!("{kpid}.queue.{index}"), msg)?;
        self.inc_stat("promiseQueuesLength")
    }

    pub fn set_decider(&self, kpid: &str, decider_vat_id: &str) -> KernelResult<()> {
        insist_vat_id(decider_vat_id)?;
        self.insist_unresolved(kpid)?;
        Ok(self.kv().set(&format!("{kpid}.decider"), decider_vat_id)?)
    }

    pub fn clear_decider(&self, kpid: &str) -> KernelResult<()> {
        self.insist_unresolved(kpid)?;
        Ok(self.kv().set(&format!("{kpid}.decider"), "")?)
    }

    /// Drop the unresolved bookkeeping and return the queued messages.
    fn delete_unresolved_state(&mut self, kpid: &str) -> KernelResult<Vec<Message>> {
        let queue_prefix = format!("{kpid}.queue.");
        let queue = helpers::get_prefixed_values(self.kv(), &queue_prefix)?
            .iter()
            .map(|raw| serde_json::from_str(raw))
            .collect::<Result<Vec<Message>, _>>()?;
        let kv = self.kv();
        for suffix in ["state", "decider", "subscribers", "policy", "queue.nextID"] {
            kv.delete(&format!("{kpid}.{suffix}"))?;
        }
        helpers::delete_prefixed_keys(kv, &queue_prefix)?;
        self.dec_stat_by("promiseQueuesLength", queue.len() as i64)?;
        Ok(queue)
    }

    fn insist_kernel_slot_exists(&self, kref: &str) -> KernelResult<()> {
        let slot: KernelSlot = kref.parse()?;
        let exists = match slot.slot_type {
            SlotType::Object => self.kernel_object_exists(kref)?,
            SlotType::Promise => self.has_kernel_promise(kref)?,
            SlotType::Device => self.owner_of_kernel_device(kref)?.is_some(),
        };
        if !exists {
            return Err(KernelError::UnknownKernelSlot(kref.to_string()));
        }
        Ok(())
    }

    /// Settle an unresolved promise. Queued messages move to the acceptance
    /// queue as sends to the promise itself.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: &str,
        rejected: bool,
        data: &CapData,
    ) -> KernelResult<()> {
        self.insist_unresolved(kpid)?;
        for slot in &data.slots {
            self.insist_kernel_slot_exists(slot)?;
        }
        for slot in &data.slots {
            self.increment_ref_count(slot, RefCountOptions::default())?;
        }
        let queue = self.delete_unresolved_state(kpid)?;
        for msg in queue {
            self.add_to_acceptance_queue(&RunQueueEvent::Send {
                target: kpid.to_string(),
                msg,
            })?;
        }
        self.dec_stat("kpUnresolved")?;
        let state = if rejected { "rejected" } else { "fulfilled" };
        self.inc_stat(state_stat(state)?)?;
        let kv = self.kv();
        kv.set(&format!("{kpid}.state"), state)?;
        kv.set(&format!("{kpid}.data.body"), &data.body)?;
        kv.set(&format!("{kpid}.data.slots"), &data.slots.join(","))?;
        log::debug!("resolved {kpid} as {state}");
        Ok(())
    }

    pub fn delete_kernel_promise(&mut self, kpid: &str) -> KernelResult<()> {
        let state = self.promise_state(kpid)?;
        let stat = state_stat(&state)?;
        if state == "unresolved" {
            self.delete_unresolved_state(kpid)?;
        } else {
            self.kv().delete(&format!("{kpid}.state"))?;
        }
        let kv = self.kv();
        for suffix in ["refCount", "data.body", "data.slots"] {
            kv.delete(&format!("{kpid}.{suffix}"))?;
        }
        self.dec_stat(stat)?;
        self.dec_stat("kernelPromises")
    }
}
