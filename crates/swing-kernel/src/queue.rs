//! Durable FIFO queues, plus the small GC and reap work lists.
//!
//! A queue `q` keeps `[head,tail]` under `q` and one JSON entry per occupied
//! index under `q.<index>`.

use std::collections::BTreeSet;

use swing_store::KvStore;

use crate::slots::insist_vat_id;
use crate::{KernelKeeper, KernelResult, RunQueueEvent};

const RUN_QUEUE: &str = "runQueue";
const ACCEPTANCE_QUEUE: &str = "acceptanceQueue";

impl KernelKeeper {
    fn queue_bounds(&self, queue: &str) -> KernelResult<[u64; 2]> {
        self.get_json(queue)
    }

    fn enqueue(&self, queue: &str, event: &RunQueueEvent) -> KernelResult<()> {
        let [head, tail] = self.queue_bounds(queue)?;
        self.set_json(&format!("{queue}.{tail}"), event)?;
        self.set_json(queue, &[head, tail + 1])
    }

    fn dequeue(&self, queue: &str) -> KernelResult<Option<RunQueueEvent>> {
        let [head, tail] = self.queue_bounds(queue)?;
        if head >= tail {
            return Ok(None);
        }
        let key = format!("{queue}.{head}");
        let event = self.get_json(&key)?;
        self.kv().delete(&key)?;
        self.set_json(queue, &[head + 1, tail])?;
        Ok(Some(event))
    }

    fn queue_length(&self, queue: &str) -> KernelResult<u64> {
        let [head, tail] = self.queue_bounds(queue)?;
        Ok(tail - head)
    }

    pub fn add_to_run_queue(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        self.enqueue(RUN_QUEUE, event)?;
        self.inc_stat("runQueueLength")
    }

    pub fn get_next_run_queue_msg(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        let event = self.dequeue(RUN_QUEUE)?;
        if event.is_some() {
            self.dec_stat("runQueueLength")?;
        }
        Ok(event)
    }

    pub fn get_run_queue_length(&self) -> KernelResult<u64> {
        self.queue_length(RUN_QUEUE)
    }

    pub fn add_to_acceptance_queue(&mut self, event: &RunQueueEvent) -> KernelResult<()> {
        self.enqueue(ACCEPTANCE_QUEUE, event)?;
        self.inc_stat("acceptanceQueueLength")
    }

    pub fn get_next_acceptance_queue_msg(&mut self) -> KernelResult<Option<RunQueueEvent>> {
        let event = self.dequeue(ACCEPTANCE_QUEUE)?;
        if event.is_some() {
            self.dec_stat("acceptanceQueueLength")?;
        }
        Ok(event)
    }

    pub fn get_acceptance_queue_length(&self) -> KernelResult<u64> {
        self.queue_length(ACCEPTANCE_QUEUE)
    }

    /// Pending GC actions, each `"<vatID> <action> <kref>"`.
    pub fn get_gc_actions(&self) -> KernelResult<BTreeSet<String>> {
        let actions: Vec<String> = self.get_json("gcActions")?;
        Ok(actions.into_iter().collect())
    }

    pub fn set_gc_actions(&self, actions: &BTreeSet<String>) -> KernelResult<()> {
        let sorted: Vec<&String> = actions.iter().collect();
        self.set_json("gcActions", &sorted)
    }

    pub fn add_gc_actions<I>(&self, new_actions: I) -> KernelResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut actions = self.get_gc_actions()?;
        actions.extend(new_actions);
        self.set_gc_actions(&actions)
    }

    /// Queue a `bringOutYourDead` for the vat unless one is already waiting.
    pub fn schedule_reap(&self, vat_id: &str) -> KernelResult<()> {
        insist_vat_id(vat_id)?;
        let mut queue: Vec<String> = self.get_json("reapQueue")?;
        if !queue.iter().any(|v| v == vat_id) {
            queue.push(vat_id.to_string());
            self.set_json("reapQueue", &queue)?;
        }
        Ok(())
    }

    pub fn next_reap_action(&self) -> KernelResult<Option<RunQueueEvent>> {
        let mut queue: Vec<String> = self.get_json("reapQueue")?;
        if queue.is_empty() {
            return Ok(None);
        }
        let vat_id = queue.remove(0);
        self.set_json("reapQueue", &queue)?;
        Ok(Some(RunQueueEvent::BringOutYourDead { vat_id }))
    }
}
