//! End-to-end scheduler scenarios against the in-memory catalog and
//! device manager.

use std::sync::Arc;

use media_scheduler::catalog::{Catalog, MemCatalog};
use media_scheduler::config::{DriveTypeConfig, TapeTypeConfig};
use media_scheduler::ldm::{DeviceManager, VirtualManager};
use media_scheduler::tools;
use media_scheduler::types::{
    AdmStatus, DeviceInfo, FsStatus, FsType, MediaId, MediaInfo, MediaLock, MediaStats,
    OpStatus, ResourceFamily, Tags,
};
use media_scheduler::{Intent, Lrs, SchedConfig, SchedError};

const GIB: u64 = 1 << 30;

struct Fixture {
    catalog: Arc<MemCatalog>,
    manager: Arc<VirtualManager>,
    lrs: Lrs,
}

fn compat_config() -> SchedConfig {
    let mut config = SchedConfig::default();
    config.tape_type.insert(
        "LTO5".to_string(),
        TapeTypeConfig { drive_rw: "LTO5_drive".to_string() },
    );
    config.drive_type.insert(
        "LTO5_drive".to_string(),
        DriveTypeConfig { models: "ULT3580-TD5".to_string() },
    );
    config
}

fn setup() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let catalog = Arc::new(MemCatalog::new());
    let manager = Arc::new(VirtualManager::new());
    let catalog_handle: Arc<dyn Catalog> = catalog.clone();
    let manager_handle: Arc<dyn DeviceManager> = manager.clone();
    let lrs = Lrs::new(catalog_handle, manager_handle, compat_config()).unwrap();

    Fixture { catalog, manager, lrs }
}

fn add_drive(fixture: &Fixture, serial: &str, dev_path: &str) {
    fixture.manager.add_drive(serial, Some("ULT3580-TD5"), dev_path);
    fixture.catalog.insert_device(DeviceInfo {
        family: ResourceFamily::Tape,
        model: Some("ULT3580-TD5".to_string()),
        path: dev_path.to_string(),
        host: tools::hostname().unwrap().to_string(),
        serial: serial.to_string(),
        adm_status: AdmStatus::Unlocked,
    });
}

/// A formatted medium holding `used` of `capacity` bytes.
fn add_formatted_media(
    fixture: &Fixture,
    label: &str,
    capacity: u64,
    used: u64,
    fs_status: FsStatus,
    tags: Tags,
) -> MediaId {
    let id = MediaId::new(ResourceFamily::Tape, label).unwrap();

    fixture.manager.add_media(&id, FsType::Ltfs, capacity);
    fixture.manager.set_formatted(label);
    if used > 0 {
        fixture.manager.consume_space(label, used);
    }

    let mut record = MediaInfo::new(id.clone(), FsType::Ltfs);
    record.model = Some("LTO5".to_string());
    record.fs.status = fs_status;
    record.fs.label = label.to_string();
    record.stats = MediaStats {
        nb_obj: 0,
        logc_spc_used: 0,
        phys_spc_used: used,
        phys_spc_free: capacity - used,
    };
    record.tags = tags;
    fixture.catalog.insert_media(record);
    id
}

fn assert_no_locks(fixture: &Fixture) {
    assert_eq!(
        fixture.catalog.locks_owned_by(fixture.lrs.lock_owner()),
        Vec::<String>::new()
    );
}

fn locked_drive_count(lrs: &Lrs) -> usize {
    lrs.devices().iter().filter(|dev| dev.locked_local).count()
}

#[test]
fn write_to_already_mounted_drive() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");
    let m1 = add_formatted_media(&fixture, "M1", 10 * GIB, 0, FsStatus::Empty, Tags::default());
    fixture.manager.place_in_drive("M1", "S1");
    fixture.manager.set_mounted("M1", "/mnt/media-st0");

    let mut fixture = fixture;
    let mut intent = Intent::write(GIB);
    fixture.lrs.write_prepare(&mut intent, &Tags::default()).unwrap();

    // the already mounted drive serves the request as-is
    assert_eq!(intent.root_path, "/mnt/media-st0");
    assert_eq!(intent.media, Some(m1.clone()));
    assert_eq!(intent.fs_type, FsType::Ltfs);
    assert_eq!(fixture.lrs.devices()[0].op_status, OpStatus::Mounted);

    // exactly one drive locked, its medium marked held by us
    assert_eq!(locked_drive_count(&fixture.lrs), 1);
    let media = fixture.lrs.devices()[0].media.as_ref().unwrap();
    assert_eq!(media.lock, MediaLock::OwnedBySelf);
    assert_eq!(
        fixture.catalog.locks_owned_by(fixture.lrs.lock_owner()).len(),
        2
    );

    // the layout wrote one 1 GiB fragment
    fixture.manager.consume_space("M1", GIB);
    fixture.lrs.io_complete(&mut intent, 1, 0).unwrap();

    let record = fixture.catalog.media_record(&m1).unwrap();
    assert_eq!(record.fs.status, FsStatus::Used);
    assert_eq!(record.stats.nb_obj, 1);
    assert_eq!(record.stats.phys_spc_free, 9 * GIB);
    assert_eq!(record.stats.logc_spc_used, GIB);

    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);

    // releasing an emptied intent is a no-op
    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
}

#[test]
fn write_mounts_a_loaded_medium_with_room() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");
    let m1 = add_formatted_media(&fixture, "M1", 10 * GIB, 0, FsStatus::Used, Tags::default());
    fixture.manager.place_in_drive("M1", "S1");

    let mut fixture = fixture;
    let mut intent = Intent::write(GIB);
    fixture.lrs.write_prepare(&mut intent, &Tags::default()).unwrap();

    // no mounted candidate, so the loaded medium got mounted in place
    assert_eq!(intent.root_path, "/mnt/media-st0");
    assert_eq!(intent.media, Some(m1));
    assert_eq!(fixture.lrs.devices()[0].op_status, OpStatus::Mounted);
    assert_eq!(fixture.lrs.devices()[0].mnt_path, "/mnt/media-st0");

    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
}

#[test]
fn write_evicts_full_drive_for_new_medium() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    // M1 fills the only drive and has no room left
    let m1 = add_formatted_media(&fixture, "M1", 5 * GIB, 5 * GIB, FsStatus::Used, Tags::default());
    fixture.manager.place_in_drive("M1", "S1");
    fixture.manager.set_mounted("M1", "/mnt/media-st0");

    // M2 sits in a slot with enough room
    let m2 = add_formatted_media(&fixture, "M2", 5 * GIB, 0, FsStatus::Empty, Tags::default());

    let mut fixture = fixture;
    let mut intent = Intent::write(GIB);
    fixture.lrs.write_prepare(&mut intent, &Tags::default()).unwrap();

    // the mounted drive was evicted and reloaded with M2
    assert_eq!(intent.root_path, "/mnt/media-st0");
    assert_eq!(intent.media, Some(m2.clone()));
    assert_eq!(fixture.manager.drive_media("S1").unwrap(), "M2");
    assert!(fixture.manager.media_in_slot("M1"));

    // M1's lock went away with the unload, only S1 and M2 stay locked
    let locks = fixture.catalog.locks_owned_by(fixture.lrs.lock_owner());
    assert_eq!(locks, vec!["device:S1".to_string(), "media:tape:M2".to_string()]);

    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
    let _ = m1;
}

#[test]
fn write_returns_busy_when_all_candidates_locked_elsewhere() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    let tags = Tags::new(vec!["archive"]);
    for label in &["X", "Y"] {
        let id = add_formatted_media(&fixture, label, 10 * GIB, 0, FsStatus::Used, tags.clone());
        fixture.catalog.media_lock(&id, "other-host:1:2:3").unwrap();
    }
    // a third medium misses the tag and must not be considered
    add_formatted_media(&fixture, "Z", 10 * GIB, 0, FsStatus::Used, Tags::default());

    let mut fixture = fixture;
    let mut intent = Intent::write(GIB);
    match fixture.lrs.write_prepare(&mut intent, &tags) {
        Err(SchedError::Busy) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_no_locks(&fixture);
    assert_eq!(locked_drive_count(&fixture.lrs), 0);
}

#[test]
fn write_with_nothing_fitting_is_no_space() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");
    add_formatted_media(&fixture, "M1", GIB, 0, FsStatus::Used, Tags::default());

    let mut fixture = fixture;
    let mut intent = Intent::write(100 * GIB);
    match fixture.lrs.write_prepare(&mut intent, &Tags::default()) {
        Err(SchedError::NoSpace) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_no_locks(&fixture);
}

#[test]
fn read_of_blank_medium_is_invalid_and_lock_free() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    let id = MediaId::new(ResourceFamily::Tape, "B1").unwrap();
    fixture.manager.add_media(&id, FsType::Ltfs, 10 * GIB);
    let mut record = MediaInfo::new(id.clone(), FsType::Ltfs);
    record.model = Some("LTO5".to_string());
    fixture.catalog.insert_media(record);

    let mut fixture = fixture;
    let mut intent = Intent::read(id);
    match fixture.lrs.read_prepare(&mut intent) {
        Err(SchedError::InvalidArgument(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_no_locks(&fixture);
}

#[test]
fn read_loads_and_mounts_the_named_medium() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");
    let id = add_formatted_media(&fixture, "R1", 10 * GIB, GIB, FsStatus::Used, Tags::default());

    let mut fixture = fixture;
    let mut intent = Intent::read(id.clone());
    fixture.lrs.read_prepare(&mut intent).unwrap();

    assert_eq!(intent.root_path, "/mnt/media-st0");
    assert_eq!(intent.fs_type, FsType::Ltfs);
    assert_eq!(fixture.manager.drive_media("S1").unwrap(), "R1");
    assert_eq!(fixture.lrs.devices()[0].op_status, OpStatus::Mounted);
    assert_eq!(locked_drive_count(&fixture.lrs), 1);

    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
}

#[test]
fn read_of_unknown_medium_is_not_found() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    let mut fixture = fixture;
    let id = MediaId::new(ResourceFamily::Tape, "NOPE").unwrap();
    let mut intent = Intent::read(id);
    match fixture.lrs.read_prepare(&mut intent) {
        Err(SchedError::NotFound(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_no_locks(&fixture);
}

#[test]
fn readonly_mount_marks_media_full_and_retries() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    // the almost-full cartridge advertises a little room but its
    // filesystem will only mount read-only
    let m_ro = add_formatted_media(&fixture, "RO", 2 * GIB, 0, FsStatus::Used, Tags::default());
    fixture.manager.set_readonly("RO", true);

    let m_ok = add_formatted_media(&fixture, "OK", 8 * GIB, 0, FsStatus::Used, Tags::default());

    let mut fixture = fixture;
    let mut intent = Intent::write(GIB);
    fixture.lrs.write_prepare(&mut intent, &Tags::default()).unwrap();

    // best-fit tried RO first, found it read-only, condemned it and
    // moved on to OK
    assert_eq!(intent.media, Some(m_ok));
    assert_eq!(fixture.manager.drive_media("S1").unwrap(), "OK");
    assert_eq!(
        fixture.catalog.media_record(&m_ro).unwrap().fs.status,
        FsStatus::Full
    );

    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
}

#[test]
fn format_blank_medium_with_unlock() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    let id = MediaId::new(ResourceFamily::Tape, "F1").unwrap();
    fixture.manager.add_media(&id, FsType::Ltfs, 10 * GIB);
    let mut record = MediaInfo::new(id.clone(), FsType::Ltfs);
    record.model = Some("LTO5".to_string());
    record.adm_status = AdmStatus::Locked;
    fixture.catalog.insert_media(record);

    let mut fixture = fixture;
    fixture.lrs.format(&id, FsType::Ltfs, true).unwrap();

    let record = fixture.catalog.media_record(&id).unwrap();
    assert_eq!(record.fs.status, FsStatus::Empty);
    assert_eq!(record.adm_status, AdmStatus::Unlocked);
    assert_eq!(record.fs.label, "F1");
    assert_eq!(record.stats.phys_spc_free, 10 * GIB);
    assert_eq!(record.stats.phys_spc_used, 0);

    assert_no_locks(&fixture);
    // the medium stays in the drive, ready for use
    assert_eq!(fixture.manager.drive_media("S1").unwrap(), "F1");
}

#[test]
fn format_of_non_blank_medium_is_invalid() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");
    let id = add_formatted_media(&fixture, "U1", 10 * GIB, 0, FsStatus::Used, Tags::default());

    let mut fixture = fixture;
    match fixture.lrs.format(&id, FsType::Ltfs, false) {
        Err(SchedError::InvalidArgument(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_no_locks(&fixture);
}

#[test]
fn device_add_extends_the_registry() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    let mut fixture = fixture;
    fixture.lrs.load_device_state().unwrap();
    assert_eq!(fixture.lrs.devices().len(), 1);

    fixture.manager.add_drive("S2", Some("ULT3580-TD5"), "/dev/st1");
    fixture
        .lrs
        .device_add(DeviceInfo {
            family: ResourceFamily::Tape,
            model: Some("ULT3580-TD5".to_string()),
            path: "/dev/st1".to_string(),
            host: tools::hostname().unwrap().to_string(),
            serial: "S2".to_string(),
            adm_status: AdmStatus::Unlocked,
        })
        .unwrap();

    assert_eq!(fixture.lrs.devices().len(), 2);
    assert_eq!(fixture.lrs.devices()[1].op_status, OpStatus::Empty);
}

#[test]
fn mismatching_device_identity_fails_the_drive_only() {
    let fixture = setup();
    add_drive(&fixture, "S1", "/dev/st0");

    // catalog says this drive is a different model than the hardware
    fixture.manager.add_drive("S2", Some("ULT3580-TD6"), "/dev/st1");
    fixture.catalog.insert_device(DeviceInfo {
        family: ResourceFamily::Tape,
        model: Some("ULT3580-TD5".to_string()),
        path: "/dev/st1".to_string(),
        host: tools::hostname().unwrap().to_string(),
        serial: "S2".to_string(),
        adm_status: AdmStatus::Unlocked,
    });

    let mut fixture = fixture;
    fixture.lrs.load_device_state().unwrap();

    let statuses: Vec<OpStatus> = fixture
        .lrs
        .devices()
        .iter()
        .map(|dev| dev.op_status)
        .collect();
    assert_eq!(statuses, vec![OpStatus::Empty, OpStatus::Failed]);

    // the failed drive stays out of selection: writes still work on S1
    add_formatted_media(&fixture, "M1", 10 * GIB, 0, FsStatus::Used, Tags::default());
    let mut intent = Intent::write(GIB);
    fixture.lrs.write_prepare(&mut intent, &Tags::default()).unwrap();
    assert_eq!(fixture.manager.drive_media("S1").unwrap(), "M1");
    fixture.lrs.resource_release(&mut intent).unwrap();
    assert_no_locks(&fixture);
}
