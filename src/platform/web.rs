//! Browser save device backed by LocalStorage
//!
//! Keys for a container `savebridge/user<id>/<dir_name>`:
//! - `<container>/manifest`: blob lengths and CRC32s
//! - `<container>/params`: title metadata
//! - `<container>/blob/<name>`: blob bytes as a JSON array
//!
//! Backups alternate between two slots, `<container>.bak0` and
//! `<container>.bak1`. The key `<container>.bak` names the valid one and is
//! only rewritten once the other slot is fully copied. LocalStorage is
//! synchronous, so every completion is posted before the call returns; the
//! controller still picks it up on its next tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use web_sys::Storage;

use super::device::{
    ContainerParams, DialogRequest, MountHandle, MountMode, MountRequest, SaveDevice, Transfer,
    spare_backup_slot,
};
use crate::persistence::{
    CallOutput, CallResult, DeviceFailure, EventSender, Ticket, read_chunked, write_chunked,
};

const KEY_ROOT: &str = "savebridge";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    blocks: u64,
    files: BTreeMap<String, BlobEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlobEntry {
    len: u64,
    crc32: u32,
}

#[derive(Debug, Serialize)]
struct StoredParams<'a> {
    title: &'a str,
    subtitle: &'a str,
    detail: &'a str,
}

#[derive(Debug)]
struct MountedKey {
    id: u64,
    container: String,
    writable: bool,
}

pub struct WebStorageDevice {
    events: EventSender,
    mounted: Option<MountedKey>,
    next_id: u64,
}

impl WebStorageDevice {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            mounted: None,
            next_id: 0,
        }
    }

    fn container_key(user_id: i32, dir_name: &str) -> String {
        format!("{}/user{}/{}", KEY_ROOT, user_id, dir_name)
    }

    fn lookup(&self, handle: &MountHandle) -> Result<(String, bool), DeviceFailure> {
        match &self.mounted {
            Some(m) if m.id == handle.id() => Ok((m.container.clone(), m.writable)),
            _ => {
                log::error!("[WebStorage] Unknown mount handle {:?}", handle);
                Err(DeviceFailure::internal())
            }
        }
    }

    fn do_mount(&mut self, request: &MountRequest) -> CallResult {
        if self.mounted.is_some() {
            return Err(DeviceFailure::busy());
        }
        let storage = storage()?;
        let container = Self::container_key(request.user_id, &request.dir_name);
        let exists = get(&storage, &manifest_key(&container))?.is_some();

        let writable = match request.mode {
            MountMode::ReadOnly => {
                if !exists {
                    return Err(DeviceFailure::not_found());
                }
                false
            }
            MountMode::ReadWrite { blocks } => {
                if !exists {
                    save_manifest(
                        &storage,
                        &container,
                        &Manifest {
                            blocks,
                            files: BTreeMap::new(),
                        },
                    )?;
                    log::info!("[WebStorage] Created {}", container);
                }
                true
            }
        };

        verify_container(&storage, &container)?;

        self.next_id += 1;
        let id = self.next_id;
        self.mounted = Some(MountedKey {
            id,
            container: container.clone(),
            writable,
        });
        Ok(CallOutput::Mounted(MountHandle::new(id, container)))
    }

    fn do_transfer(&mut self, handle: &MountHandle, transfer: Transfer) -> CallResult {
        let (container, writable) = self.lookup(handle)?;
        let storage = storage()?;

        match transfer {
            Transfer::Write {
                filename,
                payload,
                chunk_size,
                progress,
            } => {
                if !writable {
                    return Err(DeviceFailure::internal());
                }
                let mut blob = Vec::with_capacity(payload.len());
                write_chunked(&mut blob, &payload, chunk_size, |p| progress.report(p))
                    .map_err(|e| DeviceFailure::from_io(&e))?;
                let json = serde_json::to_string(&blob).map_err(|_| DeviceFailure::internal())?;
                put(&storage, &blob_key(&container, &filename), &json)?;

                let mut manifest = load_manifest(&storage, &container)?;
                manifest.files.insert(
                    filename,
                    BlobEntry {
                        len: blob.len() as u64,
                        crc32: crc32fast::hash(&blob),
                    },
                );
                save_manifest(&storage, &container, &manifest)?;
                Ok(CallOutput::Unit)
            }
            Transfer::Read {
                filename,
                chunk_size,
                progress,
            } => {
                let manifest = load_manifest(&storage, &container)?;
                let entry = manifest
                    .files
                    .get(&filename)
                    .ok_or_else(DeviceFailure::not_found)?;
                let blob = load_blob(&storage, &container, &filename, entry)?;
                let data = read_chunked(&blob[..], blob.len(), chunk_size, |p| progress.report(p))
                    .map_err(|e| DeviceFailure::from_io(&e))?;
                Ok(CallOutput::Data(data))
            }
        }
    }

    fn do_unmount(&mut self, handle: &MountHandle, backup: bool) -> CallResult {
        let (container, _) = self.lookup(handle)?;
        self.mounted = None;
        if backup {
            write_backup(&storage()?, &container)?;
        }
        Ok(CallOutput::Unit)
    }

    fn complete(&self, ticket: Ticket, result: CallResult) -> Result<(), DeviceFailure> {
        self.events.complete(ticket, result);
        Ok(())
    }
}

fn storage() -> Result<Storage, DeviceFailure> {
    web_sys::window()
        .and_then(|w| w.local_storage().ok())
        .flatten()
        .ok_or_else(|| {
            log::error!("[WebStorage] LocalStorage unavailable");
            DeviceFailure::internal()
        })
}

fn manifest_key(container: &str) -> String {
    format!("{}/manifest", container)
}

fn params_key(container: &str) -> String {
    format!("{}/params", container)
}

fn blob_key(container: &str, filename: &str) -> String {
    format!("{}/blob/{}", container, filename)
}

fn get(storage: &Storage, key: &str) -> Result<Option<String>, DeviceFailure> {
    storage.get_item(key).map_err(|e| {
        log::error!("[WebStorage] Read of {} failed: {:?}", key, e);
        DeviceFailure::internal()
    })
}

/// Writes fail when the origin's quota is exhausted
fn put(storage: &Storage, key: &str, value: &str) -> Result<(), DeviceFailure> {
    storage.set_item(key, value).map_err(|e| {
        log::warn!("[WebStorage] Write of {} failed: {:?}", key, e);
        DeviceFailure::no_free_space(value.len().div_ceil(crate::consts::BLOCK_SIZE as usize) as u64)
    })
}

fn remove(storage: &Storage, key: &str) -> Result<(), DeviceFailure> {
    storage.remove_item(key).map_err(|e| {
        log::error!("[WebStorage] Remove of {} failed: {:?}", key, e);
        DeviceFailure::internal()
    })
}

fn keys_under(storage: &Storage, prefix: &str) -> Result<Vec<String>, DeviceFailure> {
    let prefix = format!("{}/", prefix);
    let len = storage.length().map_err(|_| DeviceFailure::internal())?;
    let mut keys = Vec::new();
    for index in 0..len {
        if let Ok(Some(key)) = storage.key(index) {
            if key.starts_with(&prefix) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

fn remove_prefix(storage: &Storage, prefix: &str) -> Result<usize, DeviceFailure> {
    let keys = keys_under(storage, prefix)?;
    for key in &keys {
        remove(storage, key)?;
    }
    Ok(keys.len())
}

fn copy_prefix(storage: &Storage, from: &str, to: &str) -> Result<(), DeviceFailure> {
    for key in keys_under(storage, from)? {
        if let Some(value) = get(storage, &key)? {
            let target = format!("{}{}", to, &key[from.len()..]);
            put(storage, &target, &value)?;
        }
    }
    Ok(())
}

/// Slot holding the current backup of `container`, if any
fn backup_slot(storage: &Storage, container: &str) -> Result<Option<String>, DeviceFailure> {
    get(storage, &format!("{}{}", container, BACKUP_SUFFIX))
}

/// Copy `container` into the spare slot, then point the backup key at it.
/// A failed copy leaves the previous backup in place.
fn write_backup(storage: &Storage, container: &str) -> Result<(), DeviceFailure> {
    let pointer = format!("{}{}", container, BACKUP_SUFFIX);
    let current = backup_slot(storage, container)?;
    let spare = spare_backup_slot(&pointer, current.as_deref());

    remove_prefix(storage, &spare)?;
    if let Err(failure) = copy_prefix(storage, container, &spare) {
        if let Err(cleanup) = remove_prefix(storage, &spare) {
            log::warn!("[WebStorage] Could not clear partial backup {}: {}", spare, cleanup);
        }
        return Err(failure);
    }
    put(storage, &pointer, &spare)?;

    if let Some(old) = current {
        if let Err(failure) = remove_prefix(storage, &old) {
            log::warn!("[WebStorage] Could not clear old backup {}: {}", old, failure);
        }
    }
    Ok(())
}

fn load_manifest(storage: &Storage, container: &str) -> Result<Manifest, DeviceFailure> {
    let json = get(storage, &manifest_key(container))?.ok_or_else(DeviceFailure::corrupted)?;
    serde_json::from_str(&json).map_err(|e| {
        log::warn!("[WebStorage] Manifest of {} is malformed: {}", container, e);
        DeviceFailure::corrupted()
    })
}

fn save_manifest(storage: &Storage, container: &str, manifest: &Manifest) -> Result<(), DeviceFailure> {
    let json = serde_json::to_string(manifest).map_err(|_| DeviceFailure::internal())?;
    put(storage, &manifest_key(container), &json)
}

fn load_blob(
    storage: &Storage,
    container: &str,
    filename: &str,
    entry: &BlobEntry,
) -> Result<Vec<u8>, DeviceFailure> {
    let json = get(storage, &blob_key(container, filename))?.ok_or_else(DeviceFailure::corrupted)?;
    let blob: Vec<u8> = serde_json::from_str(&json).map_err(|_| DeviceFailure::corrupted())?;
    if blob.len() as u64 != entry.len || crc32fast::hash(&blob) != entry.crc32 {
        log::warn!("[WebStorage] Blob '{}' fails its checksum", filename);
        return Err(DeviceFailure::corrupted());
    }
    Ok(blob)
}

fn verify_container(storage: &Storage, container: &str) -> Result<(), DeviceFailure> {
    let manifest = load_manifest(storage, container)?;
    for (name, entry) in &manifest.files {
        load_blob(storage, container, name, entry)?;
    }
    Ok(())
}

impl SaveDevice for WebStorageDevice {
    fn name(&self) -> &str {
        "localstorage"
    }

    fn supports_metadata(&self) -> bool {
        true
    }

    fn mount(&mut self, ticket: Ticket, request: &MountRequest) -> Result<(), DeviceFailure> {
        let result = self.do_mount(request);
        self.complete(ticket, result)
    }

    fn configure(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        params: &ContainerParams,
    ) -> Result<(), DeviceFailure> {
        let result = self.lookup(handle).and_then(|(container, _)| {
            let stored = StoredParams {
                title: &params.title,
                subtitle: &params.subtitle,
                detail: &params.detail,
            };
            let json = serde_json::to_string(&stored).map_err(|_| DeviceFailure::internal())?;
            put(&storage()?, &params_key(&container), &json)?;
            Ok(CallOutput::Unit)
        });
        self.complete(ticket, result)
    }

    fn transfer(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        transfer: Transfer,
    ) -> Result<(), DeviceFailure> {
        let result = self.do_transfer(handle, transfer);
        self.complete(ticket, result)
    }

    fn unmount(
        &mut self,
        ticket: Ticket,
        handle: MountHandle,
        backup: bool,
    ) -> Result<(), DeviceFailure> {
        let result = self.do_unmount(&handle, backup);
        self.complete(ticket, result)
    }

    fn delete(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let container = Self::container_key(user_id, dir_name);
        let result = if self.mounted.as_ref().is_some_and(|m| m.container == container) {
            Err(DeviceFailure::busy())
        } else {
            storage()
                .and_then(|storage| remove_prefix(&storage, &container))
                .and_then(|removed| match removed {
                    0 => Err(DeviceFailure::not_found()),
                    _ => Ok(CallOutput::Unit),
                })
        };
        self.complete(ticket, result)
    }

    fn check_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let container = Self::container_key(user_id, dir_name);
        let result = storage().and_then(|storage| {
            let slot = backup_slot(&storage, &container)?.ok_or_else(DeviceFailure::not_found)?;
            match get(&storage, &manifest_key(&slot))? {
                Some(_) => Ok(CallOutput::Unit),
                None => Err(DeviceFailure::not_found()),
            }
        });
        self.complete(ticket, result)
    }

    fn restore_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let container = Self::container_key(user_id, dir_name);
        let result = storage().and_then(|storage| {
            let backup = backup_slot(&storage, &container)?.ok_or_else(DeviceFailure::not_found)?;
            verify_container(&storage, &backup)?;
            remove_prefix(&storage, &container)?;
            copy_prefix(&storage, &backup, &container)?;
            log::info!("[WebStorage] Restored {} from backup", container);
            Ok(CallOutput::Unit)
        });
        self.complete(ticket, result)
    }

    fn open_dialog(&mut self, ticket: Ticket, request: &DialogRequest) -> Result<(), DeviceFailure> {
        let window = web_sys::window().ok_or_else(DeviceFailure::internal)?;
        window
            .alert_with_message(&request.message())
            .map_err(|e| {
                log::error!("[WebStorage] Dialog failed: {:?}", e);
                DeviceFailure::internal()
            })?;
        self.complete(ticket, Ok(CallOutput::DialogClosed(0)))
    }
}
