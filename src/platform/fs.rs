//! Directory-backed save device
//!
//! Layout under the root directory:
//!
//! ```text
//! user<id>/<dir_name>/manifest.json   blob lengths and CRC32s
//! user<id>/<dir_name>/params.json     container metadata
//! user<id>/<dir_name>/icon.png
//! user<id>/<dir_name>/<blob>...
//! user<id>/<dir_name>.bak/            copy taken on unmount
//! ```
//!
//! A container whose blobs disagree with its manifest is reported as
//! corrupted when mounted. Every call runs on its own driver thread and posts
//! its completion to the dispatch queue.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::device::{
    ContainerParams, DialogRequest, MountHandle, MountMode, MountRequest, SaveDevice, Transfer,
};
use crate::persistence::{
    CallOutput, CallResult, DeviceFailure, EventSender, Ticket, TransferProgress, read_chunked,
    write_chunked,
};

const MANIFEST_FILE: &str = "manifest.json";
const PARAMS_FILE: &str = "params.json";
const ICON_FILE: &str = "icon.png";
const BACKUP_SUFFIX: &str = ".bak";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
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
struct MountedDir {
    id: u64,
    path: PathBuf,
    writable: bool,
}

#[derive(Debug, Default)]
struct MountTable {
    mounted: Option<MountedDir>,
    next_id: u64,
}

impl MountTable {
    fn lookup(&self, id: u64) -> Result<(PathBuf, bool), DeviceFailure> {
        match &self.mounted {
            Some(m) if m.id == id => Ok((m.path.clone(), m.writable)),
            _ => {
                log::error!("[FileDevice] Unknown mount handle {}", id);
                Err(DeviceFailure::internal())
            }
        }
    }
}

pub struct FileDevice {
    root: PathBuf,
    events: EventSender,
    table: Arc<Mutex<MountTable>>,
    capacity_blocks: Option<u64>,
}

impl FileDevice {
    pub fn new(root: impl Into<PathBuf>, events: EventSender) -> Self {
        Self {
            root: root.into(),
            events,
            table: Arc::new(Mutex::new(MountTable::default())),
            capacity_blocks: None,
        }
    }

    /// Refuse to create containers larger than `blocks`
    pub fn with_capacity(mut self, blocks: u64) -> Self {
        self.capacity_blocks = Some(blocks);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_path(&self, user_id: i32, dir_name: &str) -> PathBuf {
        self.root.join(format!("user{}", user_id)).join(dir_name)
    }

    pub fn backup_path(&self, user_id: i32, dir_name: &str) -> PathBuf {
        self.root
            .join(format!("user{}", user_id))
            .join(format!("{}{}", dir_name, BACKUP_SUFFIX))
    }

    /// Run `work` on a named driver thread and post its result
    fn spawn(
        &self,
        ticket: Ticket,
        work: impl FnOnce() -> CallResult + Send + 'static,
    ) -> Result<(), DeviceFailure> {
        let events = self.events.clone();
        std::thread::Builder::new()
            .name(format!("savebridge-{}", ticket.kind.as_str().to_lowercase()))
            .spawn(move || {
                let result = work();
                events.complete(ticket, result);
            })
            .map(|_| ())
            .map_err(|e| {
                log::error!("[FileDevice] Failed to spawn driver thread: {}", e);
                DeviceFailure::from_io(&e)
            })
    }
}

impl SaveDevice for FileDevice {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn supports_metadata(&self) -> bool {
        true
    }

    fn mount(&mut self, ticket: Ticket, request: &MountRequest) -> Result<(), DeviceFailure> {
        let table = Arc::clone(&self.table);
        let path = self.container_path(request.user_id, &request.dir_name);
        let mode = request.mode;
        let capacity = self.capacity_blocks;
        self.spawn(ticket, move || mount_container(&table, path, mode, capacity))
    }

    fn configure(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        params: &ContainerParams,
    ) -> Result<(), DeviceFailure> {
        let table = Arc::clone(&self.table);
        let id = handle.id();
        let params = params.clone();
        self.spawn(ticket, move || {
            let (path, _) = table.lock().lookup(id)?;
            write_params(&path, &params).map_err(|e| DeviceFailure::from_io(&e))?;
            Ok(CallOutput::Unit)
        })
    }

    fn transfer(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        transfer: Transfer,
    ) -> Result<(), DeviceFailure> {
        let table = Arc::clone(&self.table);
        let id = handle.id();
        self.spawn(ticket, move || {
            let (path, writable) = table.lock().lookup(id)?;
            match transfer {
                Transfer::Write {
                    filename,
                    payload,
                    chunk_size,
                    progress,
                } => {
                    if !writable {
                        log::error!("[FileDevice] Write to read-only mount {}", id);
                        return Err(DeviceFailure::internal());
                    }
                    write_blob(&path, &filename, &payload, chunk_size, &progress)
                        .map_err(|e| DeviceFailure::from_io(&e))?;
                    Ok(CallOutput::Unit)
                }
                Transfer::Read {
                    filename,
                    chunk_size,
                    progress,
                } => read_blob(&path, &filename, chunk_size, &progress)
                    .map(CallOutput::Data)
                    .map_err(|e| DeviceFailure::from_io(&e)),
            }
        })
    }

    fn unmount(
        &mut self,
        ticket: Ticket,
        handle: MountHandle,
        backup: bool,
    ) -> Result<(), DeviceFailure> {
        let table = Arc::clone(&self.table);
        self.spawn(ticket, move || {
            let mounted = {
                let mut table = table.lock();
                table.lookup(handle.id())?;
                table.mounted.take()
            };
            if let (Some(mounted), true) = (mounted, backup) {
                let backup_path = sibling_backup(&mounted.path);
                copy_container(&mounted.path, &backup_path)
                    .map_err(|e| DeviceFailure::from_io(&e))?;
                log::debug!("[FileDevice] Backup refreshed at {}", backup_path.display());
            }
            Ok(CallOutput::Unit)
        })
    }

    fn delete(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let table = Arc::clone(&self.table);
        let path = self.container_path(user_id, dir_name);
        self.spawn(ticket, move || {
            if table.lock().mounted.as_ref().is_some_and(|m| m.path == path) {
                return Err(DeviceFailure::busy());
            }
            fs::remove_dir_all(&path).map_err(|e| DeviceFailure::from_io(&e))?;
            log::info!("[FileDevice] Deleted {}", path.display());
            Ok(CallOutput::Unit)
        })
    }

    fn check_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let backup = self.backup_path(user_id, dir_name);
        self.spawn(ticket, move || {
            if !backup.is_dir() {
                return Err(DeviceFailure::not_found());
            }
            load_manifest(&backup).map_err(|e| DeviceFailure::from_io(&e))?;
            Ok(CallOutput::Unit)
        })
    }

    fn restore_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        let path = self.container_path(user_id, dir_name);
        let backup = self.backup_path(user_id, dir_name);
        self.spawn(ticket, move || {
            verify_container(&backup).map_err(|e| DeviceFailure::from_io(&e))?;
            copy_container(&backup, &path).map_err(|e| DeviceFailure::from_io(&e))?;
            log::info!("[FileDevice] Restored {} from backup", path.display());
            Ok(CallOutput::Unit)
        })
    }

    fn open_dialog(&mut self, ticket: Ticket, request: &DialogRequest) -> Result<(), DeviceFailure> {
        log::warn!("[FileDevice] {}", request.message());
        self.events.complete(ticket, Ok(CallOutput::DialogClosed(0)));
        Ok(())
    }
}

fn mount_container(
    table: &Mutex<MountTable>,
    path: PathBuf,
    mode: MountMode,
    capacity: Option<u64>,
) -> CallResult {
    let mut table = table.lock();
    if table.mounted.is_some() {
        return Err(DeviceFailure::busy());
    }

    let writable = match mode {
        MountMode::ReadOnly => {
            if !path.is_dir() {
                return Err(DeviceFailure::not_found());
            }
            false
        }
        MountMode::ReadWrite { blocks } => {
            if !path.is_dir() {
                if let Some(capacity) = capacity.filter(|c| *c < blocks) {
                    return Err(DeviceFailure::no_free_space(blocks - capacity));
                }
                create_container(&path, blocks).map_err(|e| DeviceFailure::from_io(&e))?;
                log::info!("[FileDevice] Created {}", path.display());
            }
            true
        }
    };

    verify_container(&path).map_err(|e| DeviceFailure::from_io(&e))?;

    table.next_id += 1;
    let id = table.next_id;
    let mount_point = path.display().to_string();
    table.mounted = Some(MountedDir { id, path, writable });
    Ok(CallOutput::Mounted(MountHandle::new(id, mount_point)))
}

fn sibling_backup(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn create_container(path: &Path, blocks: u64) -> io::Result<()> {
    fs::create_dir_all(path)?;
    save_manifest_atomic(
        path,
        &Manifest {
            version: MANIFEST_VERSION,
            blocks,
            files: BTreeMap::new(),
        },
    )
}

/// A missing or unreadable manifest means the container is corrupted
fn load_manifest(path: &Path) -> io::Result<Manifest> {
    let file = File::open(path.join(MANIFEST_FILE)).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => invalid_data("container has no manifest"),
        _ => e,
    })?;
    let manifest: Manifest =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| invalid_data(e.to_string()))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(invalid_data(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    Ok(manifest)
}

fn save_manifest_atomic(path: &Path, manifest: &Manifest) -> io::Result<()> {
    let tmp_path = path.join(format!("{}.tmp", MANIFEST_FILE));
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer_pretty(&mut writer, manifest)
            .map_err(|e| invalid_data(e.to_string()))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path.join(MANIFEST_FILE))
}

/// Check every blob against the manifest
fn verify_container(path: &Path) -> io::Result<()> {
    let manifest = load_manifest(path)?;
    for (name, entry) in &manifest.files {
        let data = fs::read(path.join(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => invalid_data(format!("blob '{}' is missing", name)),
            _ => e,
        })?;
        if data.len() as u64 != entry.len || crc32fast::hash(&data) != entry.crc32 {
            return Err(invalid_data(format!("blob '{}' fails its checksum", name)));
        }
    }
    Ok(())
}

fn check_blob_name(name: &str) -> io::Result<()> {
    let reserved = [MANIFEST_FILE, PARAMS_FILE, ICON_FILE];
    if name.is_empty()
        || name.starts_with('.')
        || name.ends_with(".tmp")
        || name.contains(['/', '\\'])
        || reserved.contains(&name)
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' is not a valid blob name", name),
        ));
    }
    Ok(())
}

fn write_params(path: &Path, params: &ContainerParams) -> io::Result<()> {
    let stored = StoredParams {
        title: &params.title,
        subtitle: &params.subtitle,
        detail: &params.detail,
    };
    let json = serde_json::to_vec_pretty(&stored).map_err(|e| invalid_data(e.to_string()))?;
    fs::write(path.join(PARAMS_FILE), json)?;
    if let Some(icon) = &params.icon {
        fs::write(path.join(ICON_FILE), icon)?;
    }
    Ok(())
}

fn write_blob(
    path: &Path,
    filename: &str,
    payload: &[u8],
    chunk_size: usize,
    progress: &TransferProgress,
) -> io::Result<()> {
    check_blob_name(filename)?;

    let tmp_path = path.join(format!("{}.tmp", filename));
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write_chunked(&mut writer, payload, chunk_size, |p| progress.report(p))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path.join(filename))?;

    let mut manifest = load_manifest(path)?;
    manifest.files.insert(
        filename.to_string(),
        BlobEntry {
            len: payload.len() as u64,
            crc32: crc32fast::hash(payload),
        },
    );
    save_manifest_atomic(path, &manifest)
}

fn read_blob(
    path: &Path,
    filename: &str,
    chunk_size: usize,
    progress: &TransferProgress,
) -> io::Result<Vec<u8>> {
    check_blob_name(filename)?;

    let manifest = load_manifest(path)?;
    let entry = manifest.files.get(filename).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no blob named '{}'", filename))
    })?;

    let file = File::open(path.join(filename))?;
    let data = read_chunked(BufReader::new(file), entry.len as usize, chunk_size, |p| {
        progress.report(p)
    })?;
    if crc32fast::hash(&data) != entry.crc32 {
        return Err(invalid_data(format!("blob '{}' fails its checksum", filename)));
    }
    Ok(data)
}

/// Replace `dst` with a flat copy of `src`
fn copy_container(src: &Path, dst: &Path) -> io::Result<()> {
    let mut tmp_name = dst.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = dst.with_file_name(tmp_name);

    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), tmp.join(entry.file_name()))?;
        }
    }

    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    fs::rename(&tmp, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        DispatchQueue, Operation, OperationOutcome, OperationReport, SaveDataController,
    };
    use crate::settings::Settings;
    use std::time::{Duration, Instant};

    fn controller(root: &Path, settings: &Settings) -> SaveDataController<FileDevice> {
        let queue = DispatchQueue::new();
        let device = FileDevice::new(root, queue.sender());
        SaveDataController::new(device, queue, settings)
    }

    fn run(controller: &mut SaveDataController<FileDevice>, op: Operation) -> OperationReport {
        controller.begin(op).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(report) = controller.update() {
                return report;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("operation did not finish");
    }

    #[test]
    fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let mut controller = controller(dir.path(), &settings);

        let report = run(&mut controller, Operation::save("slot", b"on disk".to_vec()));
        assert_eq!(report.outcome, OperationOutcome::Success);

        let device = controller.device();
        let path = device.container_path(settings.user_id, "saves");
        assert!(path.join(MANIFEST_FILE).is_file());
        assert!(path.join(PARAMS_FILE).is_file());
        assert!(device.backup_path(settings.user_id, "saves").is_dir());

        let report = run(&mut controller, Operation::load("slot"));
        assert_eq!(report.outcome, OperationOutcome::Success);
        assert_eq!(report.payload, b"on disk");
    }

    #[test]
    fn test_fresh_load_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path(), &Settings::default());

        let report = run(&mut controller, Operation::load("slot"));

        assert_eq!(report.outcome, OperationOutcome::Success);
        assert!(report.payload.is_empty());
    }

    #[test]
    fn test_tampered_blob_restored_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let mut controller = controller(dir.path(), &settings);
        run(&mut controller, Operation::save("slot", b"original".to_vec()));

        let path = controller.device().container_path(settings.user_id, "saves");
        fs::write(path.join("slot"), b"tampered").unwrap();

        let report = run(&mut controller, Operation::load("slot"));
        assert_eq!(report.outcome, OperationOutcome::Success);
        assert_eq!(report.payload, b"original");
    }

    #[test]
    fn test_tampered_blob_without_backup_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            backup_on_unmount: false,
            ..Settings::default()
        };
        let mut controller = controller(dir.path(), &settings);
        run(&mut controller, Operation::save("slot", b"original".to_vec()));

        let path = controller.device().container_path(settings.user_id, "saves");
        fs::remove_file(path.join(MANIFEST_FILE)).unwrap();

        let report = run(&mut controller, Operation::load("slot"));
        assert_eq!(report.outcome, OperationOutcome::NotFound);
        assert!(!path.exists());
    }

    #[test]
    fn test_capacity_limit_reports_no_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let queue = DispatchQueue::new();
        let device = FileDevice::new(dir.path(), queue.sender()).with_capacity(10);
        let mut controller = SaveDataController::new(device, queue, &settings);

        let report = run(&mut controller, Operation::save("slot", vec![1]));

        assert_eq!(report.outcome, OperationOutcome::NoFreeSpace);
    }

    #[test]
    fn test_reserved_blob_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path(), &Settings::default());

        let report = run(&mut controller, Operation::save(MANIFEST_FILE, vec![1]));

        assert_eq!(report.outcome, OperationOutcome::GenericError);
        let report = run(&mut controller, Operation::save("ok", vec![1]));
        assert_eq!(report.outcome, OperationOutcome::Success);
    }

    #[test]
    fn test_verify_detects_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        create_container(dir.path(), 100).unwrap();
        write_blob(dir.path(), "a", b"abc", 2, &TransferProgress::new()).unwrap();
        assert!(verify_container(dir.path()).is_ok());

        fs::write(dir.path().join("a"), b"abd").unwrap();
        let err = verify_container(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
