//! Kernel-wide bookkeeping: boot state, ID allocation, name tables, kernel
//! objects and devices, reference counts, and stats persistence.
//!
//! Every table is a key range in the kernel KV store; nothing is cached here
//! except the stats tallies, which are written back on each crank hash.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Serialize, de::DeserializeOwned};
use swing_store::{
    CrankHashes, HostStorage, KernelKvStore, KernelStorage, KvStore, StoreError, helpers,
};

use crate::config::{KernelConfig, ManagerType, ReapInterval};
use crate::slots::{
    KernelSlot, SlotType, insist_device_id, insist_vat_id, make_device_id, make_vat_id,
};
use crate::stats::{KERNEL_STATS_METRICS, KernelStats, SerializedStats};
use crate::{KernelError, KernelResult};

const KERNEL_STATS_KEY: &str = "kernelStats";
const LOCAL_KERNEL_STATS_KEY: &str = "local.kernelStats";

/// `reachable,recognizable` pair kept for every kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectRefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

/// How a reference is being added or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCountOptions {
    /// The reference is the exporting vat's own c-list entry; objects don't count those.
    pub is_export: bool,
    /// Touch only the recognizable half of an object refcount.
    pub only_recognizable: bool,
}

/// Keeper caches captured alongside a store savepoint.
struct Savepoint {
    name: String,
    stats: KernelStats,
    maybe_free_krefs: BTreeSet<String>,
}

pub struct KernelKeeper {
    storage: KernelStorage,
    stats: KernelStats,
    maybe_free_krefs: BTreeSet<String>,
    savepoints: Vec<Savepoint>,
}

impl KernelKeeper {
    pub fn new(storage: KernelStorage) -> Self {
        Self {
            storage,
            stats: KernelStats::new(KERNEL_STATS_METRICS),
            maybe_free_krefs: BTreeSet::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn storage(&self) -> &KernelStorage {
        &self.storage
    }

    pub fn kv(&self) -> &KernelKvStore {
        self.storage.kv()
    }

    pub(crate) fn get_required(&self, key: &str) -> KernelResult<String> {
        Ok(helpers::get_required(self.kv(), key)?)
    }

    pub(crate) fn get_u64(&self, key: &str) -> KernelResult<u64> {
        let raw = self.get_required(key)?;
        raw.parse()
            .map_err(|_| KernelError::Corrupt(format!("{key} is not a count: '{raw}'")))
    }

    pub(crate) fn set_u64(&self, key: &str, value: u64) -> KernelResult<()> {
        Ok(self.kv().set(key, &value.to_string())?)
    }

    /// Hand out the current value of a `*.nextID` counter and bump it.
    pub(crate) fn allocate_id(&self, counter_key: &str) -> KernelResult<u64> {
        let id = self.get_u64(counter_key)?;
        self.set_u64(counter_key, id + 1)?;
        Ok(id)
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> KernelResult<T> {
        Ok(serde_json::from_str(&self.get_required(key)?)?)
    }

    pub(crate) fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> KernelResult<()> {
        Ok(self.kv().set(key, &serde_json::to_string(value)?)?)
    }

    // Boot

    pub fn get_initialized(&self) -> KernelResult<bool> {
        Ok(self.kv().has("initialized")?)
    }

    pub fn set_initialized(&self) -> KernelResult<()> {
        Ok(self.kv().set("initialized", "true")?)
    }

    /// Write the fixed set of keys a brand-new kernel starts from.
    pub fn create_starting_kernel_state(&mut self, config: &KernelConfig) -> KernelResult<()> {
        config.validate()?;
        let kv = self.kv();
        kv.set("crankNumber", "0")?;
        kv.set("gcActions", "[]")?;
        kv.set("runQueue", "[1,1]")?;
        kv.set("acceptanceQueue", "[1,1]")?;
        kv.set("reapQueue", "[]")?;
        kv.set("vat.nextID", "1")?;
        kv.set("vat.nextUpgradeID", "1")?;
        kv.set("vat.names", "[]")?;
        kv.set("vat.dynamicIDs", "[]")?;
        kv.set("device.names", "[]")?;
        kv.set("device.nextID", "7")?;
        kv.set("ko.nextID", "20")?;
        kv.set("kd.nextID", "30")?;
        kv.set("kp.nextID", "40")?;
        kv.set("meter.nextID", "1")?;
        kv.set(
            "kernel.defaultManagerType",
            config.default_manager_type.as_str(),
        )?;
        kv.set(
            "kernel.defaultReapInterval",
            &config.default_reap_interval.to_string(),
        )?;
        kv.set(
            "kernel.snapshotInitial",
            &config.snapshot_initial.to_string(),
        )?;
        kv.set(
            "kernel.snapshotInterval",
            &config.snapshot_interval.to_string(),
        )?;
        self.stats.initialize_stats();
        log::debug!("created starting kernel state");
        Ok(())
    }

    pub fn get_default_manager_type(&self) -> KernelResult<ManagerType> {
        self.get_required("kernel.defaultManagerType")?.parse()
    }

    pub fn get_default_reap_interval(&self) -> KernelResult<ReapInterval> {
        self.get_required("kernel.defaultReapInterval")?.parse()
    }

    pub fn set_default_reap_interval(&self, interval: ReapInterval) -> KernelResult<()> {
        if interval == ReapInterval::Every(0) {
            return Err(KernelError::InvalidConfig(
                "reap interval must be positive or 'never'".into(),
            ));
        }
        Ok(self
            .kv()
            .set("kernel.defaultReapInterval", &interval.to_string())?)
    }

    pub fn get_snapshot_initial(&self) -> KernelResult<u64> {
        self.get_u64("kernel.snapshotInitial")
    }

    pub fn get_snapshot_interval(&self) -> KernelResult<u64> {
        self.get_u64("kernel.snapshotInterval")
    }

    pub fn get_crank_number(&self) -> KernelResult<u64> {
        self.get_u64("crankNumber")
    }

    pub fn increment_crank_number(&self) -> KernelResult<()> {
        let crank = self.get_crank_number()?;
        self.set_u64("crankNumber", crank + 1)
    }

    // Vats and devices

    pub fn allocate_unused_vat_id(&self) -> KernelResult<String> {
        Ok(make_vat_id(self.allocate_id("vat.nextID")?))
    }

    pub fn allocate_vat_id_for_name_if_needed(&self, name: &str) -> KernelResult<String> {
        self.allocate_for_name_if_needed("vat", name, |keeper| keeper.allocate_unused_vat_id())
    }

    pub fn get_vat_id_for_name(&self, name: &str) -> KernelResult<String> {
        self.kv()
            .get(&format!("vat.name.{name}"))?
            .ok_or_else(|| KernelError::UnknownVatName(name.to_string()))
    }

    /// `(name, vatID)` for every statically named vat, sorted by name.
    pub fn get_static_vats(&self) -> KernelResult<Vec<(String, String)>> {
        self.named_entries("vat")
    }

    pub fn add_dynamic_vat_id(&self, vat_id: &str) -> KernelResult<()> {
        insist_vat_id(vat_id)?;
        let mut ids: Vec<String> = self.get_json("vat.dynamicIDs")?;
        ids.push(vat_id.to_string());
        self.set_json("vat.dynamicIDs", &ids)
    }

    pub fn get_dynamic_vats(&self) -> KernelResult<Vec<String>> {
        self.get_json("vat.dynamicIDs")
    }

    pub fn allocate_upgrade_id(&self) -> KernelResult<String> {
        Ok(format!("up{}", self.allocate_id("vat.nextUpgradeID")?))
    }

    pub fn allocate_device_id_for_name_if_needed(&self, name: &str) -> KernelResult<String> {
        self.allocate_for_name_if_needed("device", name, |keeper| {
            Ok(make_device_id(keeper.allocate_id("device.nextID")?))
        })
    }

    pub fn get_device_id_for_name(&self, name: &str) -> KernelResult<String> {
        self.kv()
            .get(&format!("device.name.{name}"))?
            .ok_or_else(|| KernelError::UnknownDeviceName(name.to_string()))
    }

    /// `(name, deviceID)` for every device, sorted by name.
    pub fn get_devices(&self) -> KernelResult<Vec<(String, String)>> {
        self.named_entries("device")
    }

    fn allocate_for_name_if_needed(
        &self,
        class: &str,
        name: &str,
        allocate: impl FnOnce(&Self) -> KernelResult<String>,
    ) -> KernelResult<String> {
        let key = format!("{class}.name.{name}");
        if let Some(id) = self.kv().get(&key)? {
            return Ok(id);
        }
        let id = allocate(self)?;
        self.kv().set(&key, &id)?;
        let names_key = format!("{class}.names");
        let mut names: Vec<String> = self.get_json(&names_key)?;
        names.push(name.to_string());
        self.set_json(&names_key, &names)?;
        Ok(id)
    }

    fn named_entries(&self, class: &str) -> KernelResult<Vec<(String, String)>> {
        let names: Vec<String> = self.get_json(&format!("{class}.names"))?;
        let mut entries = names
            .into_iter()
            .map(|name| {
                let id = self.get_required(&format!("{class}.name.{name}"))?;
                Ok((name, id))
            })
            .collect::<KernelResult<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    // Kernel objects and device nodes

    /// Allocate a kernel object owned by `owner`. An explicit `id` bypasses
    /// the allocator, which then skips past it.
    pub fn add_kernel_object(&mut self, owner: &str, id: Option<u64>) -> KernelResult<String> {
        insist_vat_id(owner)?;
        let id = match id {
            Some(id) => {
                if id >= self.get_u64("ko.nextID")? {
                    self.set_u64("ko.nextID", id + 1)?;
                }
                id
            }
            None => self.allocate_id("ko.nextID")?,
        };
        let kref = KernelSlot::new(SlotType::Object, id).to_string();
        self.kv().set(&format!("{kref}.owner"), owner)?;
        self.set_object_ref_count(&kref, ObjectRefCount::default())?;
        self.inc_stat("kernelObjects")?;
        Ok(kref)
    }

    pub fn kernel_object_exists(&self, kref: &str) -> KernelResult<bool> {
        Ok(self.kv().has(&format!("{kref}.refCount"))?)
    }

    /// `None` once the owning vat has dropped the export (orphaned object).
    pub fn owner_of_kernel_object(&self, kref: &str) -> KernelResult<Option<String>> {
        KernelSlot::parse_as(kref, SlotType::Object)?;
        Ok(self.kv().get(&format!("{kref}.owner"))?)
    }

    pub(crate) fn orphan_kernel_object(&self, kref: &str) -> KernelResult<()> {
        Ok(self.kv().delete(&format!("{kref}.owner"))?)
    }

    pub fn get_object_ref_count(&self, kref: &str) -> KernelResult<ObjectRefCount> {
        KernelSlot::parse_as(kref, SlotType::Object)?;
        let key = format!("{kref}.refCount");
        let raw = self.get_required(&key)?;
        let corrupt = || KernelError::Corrupt(format!("{key} is not 'reachable,recognizable': '{raw}'"));
        let (reachable, recognizable) = raw.split_once(',').ok_or_else(corrupt)?;
        Ok(ObjectRefCount {
            reachable: reachable.parse().map_err(|_| corrupt())?,
            recognizable: recognizable.parse().map_err(|_| corrupt())?,
        })
    }

    pub fn set_object_ref_count(&self, kref: &str, count: ObjectRefCount) -> KernelResult<()> {
        KernelSlot::parse_as(kref, SlotType::Object)?;
        if count.reachable > count.recognizable {
            return Err(KernelError::InvalidRefCount {
                kref: kref.to_string(),
                reachable: count.reachable,
                recognizable: count.recognizable,
            });
        }
        Ok(self.kv().set(
            &format!("{kref}.refCount"),
            &format!("{},{}", count.reachable, count.recognizable),
        )?)
    }

    pub fn delete_kernel_object(&mut self, kref: &str) -> KernelResult<()> {
        KernelSlot::parse_as(kref, SlotType::Object)?;
        self.kv().delete(&format!("{kref}.owner"))?;
        self.kv().delete(&format!("{kref}.refCount"))?;
        self.dec_stat("kernelObjects")
    }

    pub fn add_kernel_device_node(&mut self, device_id: &str) -> KernelResult<String> {
        insist_device_id(device_id)?;
        let id = self.allocate_id("kd.nextID")?;
        let kref = KernelSlot::new(SlotType::Device, id).to_string();
        self.kv().set(&format!("{kref}.owner"), device_id)?;
        self.inc_stat("kernelDevices")?;
        Ok(kref)
    }

    pub fn owner_of_kernel_device(&self, kref: &str) -> KernelResult<Option<String>> {
        KernelSlot::parse_as(kref, SlotType::Device)?;
        Ok(self.kv().get(&format!("{kref}.owner"))?)
    }

    // Reference counts

    pub fn increment_ref_count(&mut self, kref: &str, opts: RefCountOptions) -> KernelResult<()> {
        let slot: KernelSlot = kref.parse()?;
        match slot.slot_type {
            SlotType::Promise => {
                let key = format!("{kref}.refCount");
                let count = self.get_u64(&key)?;
                self.set_u64(&key, count + 1)?;
            }
            SlotType::Object if !opts.is_export && self.kernel_object_exists(kref)? => {
                let mut count = self.get_object_ref_count(kref)?;
                if !opts.only_recognizable {
                    count.reachable += 1;
                }
                count.recognizable += 1;
                self.set_object_ref_count(kref, count)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop a reference. Returns true when a promise's count reaches zero.
    /// Anything that may have become collectable is remembered in
    /// [`take_maybe_free_krefs`](Self::take_maybe_free_krefs).
    pub fn decrement_ref_count(&mut self, kref: &str, opts: RefCountOptions) -> KernelResult<bool> {
        let slot: KernelSlot = kref.parse()?;
        let underflow = || KernelError::RefCountUnderflow(kref.to_string());
        match slot.slot_type {
            SlotType::Promise => {
                let key = format!("{kref}.refCount");
                let count = self.get_u64(&key)?.checked_sub(1).ok_or_else(underflow)?;
                self.set_u64(&key, count)?;
                if count == 0 {
                    self.maybe_free_krefs.insert(kref.to_string());
                    return Ok(true);
                }
            }
            SlotType::Object if !opts.is_export && self.kernel_object_exists(kref)? => {
                let mut count = self.get_object_ref_count(kref)?;
                if !opts.only_recognizable {
                    count.reachable = count.reachable.checked_sub(1).ok_or_else(underflow)?;
                }
                count.recognizable = count.recognizable.checked_sub(1).ok_or_else(underflow)?;
                if count.reachable == 0 || count.recognizable == 0 {
                    self.maybe_free_krefs.insert(kref.to_string());
                }
                self.set_object_ref_count(kref, count)?;
            }
            _ => {}
        }
        Ok(false)
    }

    pub(crate) fn decrement_reachable(&mut self, kref: &str) -> KernelResult<()> {
        let mut count = self.get_object_ref_count(kref)?;
        count.reachable = count
            .reachable
            .checked_sub(1)
            .ok_or_else(|| KernelError::RefCountUnderflow(kref.to_string()))?;
        if count.reachable == 0 {
            self.maybe_free_krefs.insert(kref.to_string());
        }
        self.set_object_ref_count(kref, count)
    }

    pub(crate) fn increment_reachable(&mut self, kref: &str) -> KernelResult<()> {
        let mut count = self.get_object_ref_count(kref)?;
        count.reachable += 1;
        self.set_object_ref_count(kref, count)
    }

    /// Krefs whose counts dropped since the last call, for the GC pass.
    pub fn take_maybe_free_krefs(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.maybe_free_krefs)
    }

    // Cranks

    pub fn start_crank(&mut self) -> KernelResult<()> {
        self.storage.start_crank()?;
        self.savepoints.clear();
        Ok(())
    }

    /// Mark a point the crank can return to. Stats tallies and pending GC
    /// candidates are captured with it.
    pub fn establish_crank_savepoint(&mut self, name: &str) -> KernelResult<()> {
        self.storage.establish_crank_savepoint(name)?;
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            stats: self.stats.clone(),
            maybe_free_krefs: self.maybe_free_krefs.clone(),
        });
        Ok(())
    }

    /// Undo the store writes and the in-memory bookkeeping since `name`.
    pub fn rollback_crank(&mut self, name: &str) -> KernelResult<()> {
        let idx = self
            .savepoints
            .iter()
            .position(|sp| sp.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.storage.rollback_crank(name)?;
        if let Some(savepoint) = self.savepoints.drain(idx..).next() {
            self.stats = savepoint.stats;
            self.maybe_free_krefs = savepoint.maybe_free_krefs;
        }
        Ok(())
    }

    pub fn end_crank(&mut self) -> KernelResult<()> {
        self.storage.end_crank()?;
        self.savepoints.clear();
        Ok(())
    }

    /// Discard uncommitted work and reload the stats from what was committed.
    pub fn abort(&mut self, host: &HostStorage) -> KernelResult<()> {
        host.abort()?;
        self.savepoints.clear();
        self.maybe_free_krefs.clear();
        self.stats = KernelStats::new(KERNEL_STATS_METRICS);
        if self.kv().has(KERNEL_STATS_KEY)? {
            self.load_stats()?;
        }
        Ok(())
    }

    // Stats and crank hashes

    pub(crate) fn inc_stat(&mut self, key: &str) -> KernelResult<()> {
        self.stats.inc_stat(key, 1)
    }

    pub(crate) fn inc_stat_by(&mut self, key: &str, delta: i64) -> KernelResult<()> {
        self.stats.inc_stat(key, delta)
    }

    pub(crate) fn dec_stat(&mut self, key: &str) -> KernelResult<()> {
        self.stats.dec_stat(key, 1)
    }

    pub(crate) fn dec_stat_by(&mut self, key: &str, delta: i64) -> KernelResult<()> {
        self.stats.dec_stat(key, delta)
    }

    pub fn get_stats(&self) -> KernelResult<IndexMap<String, i64>> {
        self.stats.get_stats(false)
    }

    pub fn get_consensus_stats(&self) -> KernelResult<IndexMap<String, i64>> {
        self.stats.get_stats(true)
    }

    /// Restore the stats tallies of a keeper opened over existing state.
    pub fn load_stats(&mut self) -> KernelResult<()> {
        let stats = SerializedStats {
            consensus_stats: self.get_required(KERNEL_STATS_KEY)?,
            local_stats: self.kv().get(LOCAL_KERNEL_STATS_KEY)?,
        };
        self.stats.load_from_serialized_stats(&stats)
    }

    fn save_stats(&self) -> KernelResult<()> {
        let stats = self.stats.get_serialized_stats()?;
        self.kv().set(KERNEL_STATS_KEY, &stats.consensus_stats)?;
        if let Some(local) = &stats.local_stats {
            self.kv().set(LOCAL_KERNEL_STATS_KEY, local)?;
        }
        Ok(())
    }

    /// Persist the stats (so they take part in consensus) and close the crank's hash.
    pub fn emit_crank_hashes(&self) -> KernelResult<CrankHashes> {
        self.save_stats()?;
        Ok(self.storage.emit_crank_hashes()?)
    }
}
