//! Per-vat state: the c-list translating between vat slots and krefs, the
//! vat's ID counters, its source and options, and its transcript.
//!
//! C-list entries come in pairs: `<vatID>.c.<kref>` holds `"R <vatSlot>"` or
//! `"_ <vatSlot>"` (the flag tracks whether the vat can reach an object), and
//! `<vatID>.c.<vatSlot>` holds the kref.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use swing_store::{KvStore, SpanBounds};

use crate::config::{ManagerType, ReapInterval};
use crate::slots::{KernelSlot, SlotType, VatSlot, insist_vat_id};
use crate::{KernelError, KernelKeeper, KernelResult, RefCountOptions, VatOptionsChange};

const FIRST_OBJECT_ID: u64 = 50;
const FIRST_PROMISE_ID: u64 = 60;
const FIRST_DEVICE_ID: u64 = 70;

/// Where a vat's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatSource {
    #[serde(rename = "bundleID", default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerOptions {
    #[serde(rename = "type")]
    pub manager_type: ManagerType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    #[serde(default)]
    pub worker_options: WorkerOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<ReapInterval>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub critical: bool,
}

impl KernelKeeper {
    /// Access one vat's state, creating its counters and transcript the
    /// first time the vat is seen.
    pub fn provide_vat_keeper(&mut self, vat_id: &str) -> KernelResult<VatKeeper<'_>> {
        insist_vat_id(vat_id)?;
        if !self.kv().has(&format!("{vat_id}.o.nextID"))? {
            self.initialize_vat_state(vat_id)?;
        }
        Ok(VatKeeper {
            keeper: self,
            vat_id: vat_id.to_string(),
        })
    }

    fn initialize_vat_state(&mut self, vat_id: &str) -> KernelResult<()> {
        self.set_u64(&format!("{vat_id}.o.nextID"), FIRST_OBJECT_ID)?;
        self.set_u64(&format!("{vat_id}.p.nextID"), FIRST_PROMISE_ID)?;
        self.set_u64(&format!("{vat_id}.d.nextID"), FIRST_DEVICE_ID)?;
        self.storage().transcripts().init_transcript(vat_id)?;
        self.inc_stat("vats")?;
        log::debug!("initialized state for vat {vat_id}");
        Ok(())
    }
}

pub struct VatKeeper<'k> {
    keeper: &'k mut KernelKeeper,
    vat_id: String,
}

impl VatKeeper<'_> {
    pub fn vat_id(&self) -> &str {
        &self.vat_id
    }

    fn clist_key(&self, slot: &str) -> String {
        format!("{}.c.{slot}", self.vat_id)
    }

    fn set_json<T: Serialize>(&self, suffix: &str, value: &T) -> KernelResult<()> {
        self.keeper
            .set_json(&format!("{}.{suffix}", self.vat_id), value)
    }

    fn get_json<T: DeserializeOwned>(&self, suffix: &str) -> KernelResult<T> {
        self.keeper.get_json(&format!("{}.{suffix}", self.vat_id))
    }

    pub fn set_source_and_options(&self, source: &VatSource, options: &VatOptions) -> KernelResult<()> {
        self.set_json("source", source)?;
        self.set_json("options", options)
    }

    pub fn get_source(&self) -> KernelResult<VatSource> {
        self.get_json("source")
    }

    pub fn get_options(&self) -> KernelResult<VatOptions> {
        self.get_json("options")
    }

    /// Apply a `changeVatOptions` request to the stored options.
    pub fn change_vat_options(&self, change: &VatOptionsChange) -> KernelResult<()> {
        let mut options = self.get_options()?;
        if let Some(interval) = change.reap_interval {
            options.reap_interval = Some(interval);
        }
        self.set_json("options", &options)
    }

    /// The reachable flag and vat slot recorded for `kref`.
    pub fn get_reachable_and_vat_slot(&self, kref: &str) -> KernelResult<(bool, String)> {
        let raw = self
            .keeper
            .kv()
            .get(&self.clist_key(kref))?
            .ok_or_else(|| KernelError::NotInClist {
                vat_id: self.vat_id.clone(),
                slot: kref.to_string(),
            })?;
        match raw.split_once(' ') {
            Some(("R", vat_slot)) => Ok((true, vat_slot.to_string())),
            Some(("_", vat_slot)) => Ok((false, vat_slot.to_string())),
            _ => Err(KernelError::Corrupt(format!(
                "bad c-list entry {} = '{raw}'",
                self.clist_key(kref)
            ))),
        }
    }

    fn set_reachable_flag(&mut self, kref: &str) -> KernelResult<()> {
        let (was_reachable, vat_slot) = self.get_reachable_and_vat_slot(kref)?;
        if was_reachable {
            return Ok(());
        }
        let slot: VatSlot = vat_slot.parse()?;
        self.keeper
            .kv()
            .set(&self.clist_key(kref), &format!("R {vat_slot}"))?;
        if slot.slot_type == SlotType::Object && !slot.allocated_by_vat {
            self.keeper.increment_reachable(kref)?;
        }
        Ok(())
    }

    /// Mark an object unreachable for this vat, e.g. after it drops an import.
    pub fn clear_reachable_flag(&mut self, kref: &str) -> KernelResult<()> {
        let (was_reachable, vat_slot) = self.get_reachable_and_vat_slot(kref)?;
        if !was_reachable {
            return Ok(());
        }
        let slot: VatSlot = vat_slot.parse()?;
        self.keeper
            .kv()
            .set(&self.clist_key(kref), &format!("_ {vat_slot}"))?;
        if slot.slot_type == SlotType::Object && !slot.allocated_by_vat {
            self.keeper.decrement_reachable(kref)?;
        }
        Ok(())
    }

    fn add_clist_entry(&mut self, kref: &str, vat_slot: &str) -> KernelResult<()> {
        let kv = self.keeper.kv();
        kv.set(&self.clist_key(kref), &format!("_ {vat_slot}"))?;
        kv.set(&self.clist_key(vat_slot), kref)?;
        self.keeper.inc_stat("clistEntries")
    }

    /// Translate a slot named by the vat into a kref. Exports the kernel has
    /// not seen before get a fresh kernel object or promise.
    pub fn map_vat_slot_to_kernel_slot(
        &mut self,
        vat_slot: &str,
        set_reachable: bool,
    ) -> KernelResult<String> {
        let slot: VatSlot = vat_slot.parse()?;
        let kref = match self.keeper.kv().get(&self.clist_key(vat_slot))? {
            Some(kref) => kref,
            None => {
                if !slot.allocated_by_vat {
                    return Err(KernelError::UnknownVatSlot {
                        vat_id: self.vat_id.clone(),
                        vat_slot: vat_slot.to_string(),
                    });
                }
                let kref = match slot.slot_type {
                    SlotType::Object => self.keeper.add_kernel_object(&self.vat_id, None)?,
                    SlotType::Promise => self.keeper.add_kernel_promise_for_vat(&self.vat_id)?,
                    SlotType::Device => {
                        return Err(KernelError::DeviceExport {
                            vat_id: self.vat_id.clone(),
                            vat_slot: vat_slot.to_string(),
                        });
                    }
                };
                self.keeper.increment_ref_count(
                    &kref,
                    RefCountOptions {
                        is_export: true,
                        only_recognizable: true,
                    },
                )?;
                self.add_clist_entry(&kref, vat_slot)?;
                log::debug!("{} exported {vat_slot} as {kref}", self.vat_id);
                kref
            }
        };
        if slot.slot_type == SlotType::Object && set_reachable {
            self.set_reachable_flag(&kref)?;
        }
        Ok(kref)
    }

    /// Translate a kref into this vat's slot, allocating an import the first time.
    pub fn map_kernel_slot_to_vat_slot(
        &mut self,
        kref: &str,
        set_reachable: bool,
    ) -> KernelResult<String> {
        let kslot: KernelSlot = kref.parse()?;
        let vat_slot = match self.keeper.kv().get(&self.clist_key(kref))? {
            Some(_) => self.get_reachable_and_vat_slot(kref)?.1,
            None => {
                let counter = format!("{}.{}.nextID", self.vat_id, kslot.slot_type.vat_char());
                let id = self.keeper.allocate_id(&counter)?;
                let vat_slot = VatSlot::new(kslot.slot_type, false, id).to_string();
                self.keeper.increment_ref_count(
                    kref,
                    RefCountOptions {
                        is_export: false,
                        only_recognizable: true,
                    },
                )?;
                self.add_clist_entry(kref, &vat_slot)?;
                vat_slot
            }
        };
        if kslot.slot_type == SlotType::Object && set_reachable {
            self.set_reachable_flag(kref)?;
        }
        Ok(vat_slot)
    }

    pub fn has_clist_entry(&self, slot: &str) -> KernelResult<bool> {
        Ok(self.keeper.kv().has(&self.clist_key(slot))?)
    }

    /// Remove both halves of a c-list pair and release the references it held.
    /// An object export that goes away leaves its kernel object ownerless.
    pub fn delete_clist_entry(&mut self, kref: &str, vat_slot: &str) -> KernelResult<()> {
        let (reachable, recorded) = self.get_reachable_and_vat_slot(kref)?;
        if recorded != vat_slot {
            return Err(KernelError::Corrupt(format!(
                "{} maps {kref} to {recorded}, not {vat_slot}",
                self.vat_id
            )));
        }
        let slot: VatSlot = vat_slot.parse()?;
        if reachable && slot.slot_type == SlotType::Object && !slot.allocated_by_vat {
            self.keeper.decrement_reachable(kref)?;
        }
        self.keeper.decrement_ref_count(
            kref,
            RefCountOptions {
                is_export: slot.allocated_by_vat,
                only_recognizable: true,
            },
        )?;
        if slot.slot_type == SlotType::Object && slot.allocated_by_vat {
            self.keeper.orphan_kernel_object(kref)?;
        }
        let kv = self.keeper.kv();
        kv.delete(&self.clist_key(kref))?;
        kv.delete(&self.clist_key(vat_slot))?;
        self.keeper.dec_stat("clistEntries")
    }

    // Transcript

    /// Position the next transcript entry will take.
    pub fn next_delivery_num(&self) -> KernelResult<u64> {
        Ok(self.transcript_bounds()?.end_pos)
    }

    pub fn transcript_bounds(&self) -> KernelResult<SpanBounds> {
        Ok(self
            .keeper
            .storage()
            .transcripts()
            .get_current_span_bounds(&self.vat_id)?)
    }

    pub fn add_to_transcript<T: Serialize>(&self, entry: &T) -> KernelResult<u64> {
        let item = serde_json::to_string(entry)?;
        Ok(self
            .keeper
            .storage()
            .transcripts()
            .add_item(&self.vat_id, &item)?)
    }

    /// Entries of the span starting at `start_pos`, or of the current span.
    pub fn get_transcript<T: DeserializeOwned>(&self, start_pos: Option<u64>) -> KernelResult<Vec<T>> {
        self.keeper
            .storage()
            .transcripts()
            .read_span(&self.vat_id, start_pos)?
            .iter()
            .map(|item| Ok(serde_json::from_str(item)?))
            .collect()
    }

    /// Close the transcript span, e.g. after a heap snapshot.
    pub fn transcript_snapshot_done(&self) -> KernelResult<SpanBounds> {
        Ok(self
            .keeper
            .storage()
            .transcripts()
            .rollover_span(&self.vat_id)?)
    }

    /// Start a fresh incarnation after the vat is upgraded.
    pub fn begin_new_incarnation(&self) -> KernelResult<SpanBounds> {
        Ok(self
            .keeper
            .storage()
            .transcripts()
            .rollover_incarnation(&self.vat_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KernelConfig, ObjectRefCount};
    use serde_json::{Value, json};
    use swing_store::{StoreOptions, SwingStore};

    fn keeper() -> KernelKeeper {
        let store = SwingStore::open_in_memory(StoreOptions::default()).unwrap();
        let mut keeper = KernelKeeper::new(store.kernel_storage());
        keeper
            .create_starting_kernel_state(&KernelConfig::default())
            .unwrap();
        keeper
    }

    #[test]
    fn first_use_initializes_counters_and_transcript() {
        let mut k = keeper();
        let vk = k.provide_vat_keeper("v1").unwrap();
        assert_eq!(vk.next_delivery_num().unwrap(), 0);
        drop(vk);
        assert_eq!(k.kv().get("v1.o.nextID").unwrap().as_deref(), Some("50"));
        assert_eq!(k.kv().get("v1.p.nextID").unwrap().as_deref(), Some("60"));
        assert_eq!(k.kv().get("v1.d.nextID").unwrap().as_deref(), Some("70"));
        k.provide_vat_keeper("v1").unwrap();
        assert_eq!(k.get_stats().unwrap()["vats"], 1);
        assert!(k.provide_vat_keeper("ko1").is_err());
    }

    #[test]
    fn imports_and_exports_adjust_refcounts() {
        let mut k = keeper();
        let ko = k.add_kernel_object("v2", None).unwrap();
        let mut vk = k.provide_vat_keeper("v1").unwrap();

        assert!(matches!(
            vk.map_vat_slot_to_kernel_slot("o-51", true),
            Err(KernelError::UnknownVatSlot { .. })
        ));
        assert!(matches!(
            vk.map_vat_slot_to_kernel_slot("d+1", true),
            Err(KernelError::DeviceExport { .. })
        ));

        assert_eq!(vk.map_kernel_slot_to_vat_slot(&ko, false).unwrap(), "o-50");
        assert_eq!(vk.get_reachable_and_vat_slot(&ko).unwrap(), (false, "o-50".into()));
        assert_eq!(vk.map_vat_slot_to_kernel_slot("o-50", true).unwrap(), ko);
        assert_eq!(vk.get_reachable_and_vat_slot(&ko).unwrap(), (true, "o-50".into()));
        vk.clear_reachable_flag(&ko).unwrap();
        vk.map_kernel_slot_to_vat_slot(&ko, true).unwrap();

        let kp = vk.map_vat_slot_to_kernel_slot("p+5", true).unwrap();
        assert_eq!(kp, "kp40");
        let export = vk.map_vat_slot_to_kernel_slot("o+1", true).unwrap();
        assert_eq!(export, "ko21");
        drop(vk);

        assert_eq!(
            k.get_object_ref_count(&ko).unwrap(),
            ObjectRefCount {
                reachable: 1,
                recognizable: 1
            }
        );
        assert_eq!(k.get_object_ref_count(&export).unwrap(), ObjectRefCount::default());
        assert_eq!(k.get_kernel_promise(&kp).unwrap().ref_count(), 1);
        assert_eq!(k.kv().get("v1.c.kp40").unwrap().as_deref(), Some("_ p+5"));
        assert_eq!(k.get_stats().unwrap()["clistEntries"], 3);

        let mut vk = k.provide_vat_keeper("v1").unwrap();
        vk.delete_clist_entry(&ko, "o-50").unwrap();
        vk.delete_clist_entry(&export, "o+1").unwrap();
        assert!(!vk.has_clist_entry("o-50").unwrap());
        assert!(vk.delete_clist_entry(&kp, "p+6").is_err());
        drop(vk);
        assert_eq!(k.get_object_ref_count(&ko).unwrap(), ObjectRefCount::default());
        assert_eq!(k.owner_of_kernel_object(&export).unwrap(), None);
        assert_eq!(k.get_stats().unwrap()["clistEntries"], 1);
        assert!(k.take_maybe_free_krefs().contains(&ko));
    }

    #[test]
    fn transcript_entries_round_trip_as_json() {
        let mut k = keeper();
        let vk = k.provide_vat_keeper("v1").unwrap();
        assert_eq!(vk.add_to_transcript(&json!({"d": ["startVat"]})).unwrap(), 0);
        assert_eq!(vk.add_to_transcript(&json!({"d": ["message", "ko20"]})).unwrap(), 1);
        assert_eq!(vk.next_delivery_num().unwrap(), 2);
        let entries: Vec<Value> = vk.get_transcript(None).unwrap();
        assert_eq!(entries[1]["d"][1], "ko20");

        let bounds = vk.transcript_snapshot_done().unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos), (2, 2));
        let old: Vec<Value> = vk.get_transcript(Some(0)).unwrap();
        assert_eq!(old.len(), 2);
        assert!(vk.begin_new_incarnation().is_err());
        vk.add_to_transcript(&json!({"d": ["stopVat"]})).unwrap();
        let bounds = vk.begin_new_incarnation().unwrap();
        assert_eq!(bounds.incarnation, 1);
        assert_eq!(vk.next_delivery_num().unwrap(), 3);
    }

    #[test]
    fn options_change_in_place() {
        let mut k = keeper();
        let vk = k.provide_vat_keeper("v1").unwrap();
        let options = VatOptions {
            name: Some("zoe".into()),
            ..Default::default()
        };
        vk.set_source_and_options(
            &VatSource {
                bundle_name: Some("zoe".into()),
                ..Default::default()
            },
            &options,
        )
        .unwrap();
        vk.change_vat_options(&VatOptionsChange {
            reap_interval: Some(ReapInterval::Never),
        })
        .unwrap();
        let options = vk.get_options().unwrap();
        assert_eq!(options.reap_interval, Some(ReapInterval::Never));
        assert_eq!(options.worker_options.manager_type, ManagerType::Local);
        assert_eq!(
            k.kv().get("v1.options").unwrap().as_deref(),
            Some(r#"{"workerOptions":{"type":"local"},"name":"zoe","reapInterval":"never"}"#)
        );
        assert_eq!(k.kv().get("v1.source").unwrap().as_deref(), Some(r#"{"bundleName":"zoe"}"#));
    }
}
