//! End-to-end tests: IRPs go in through the router, a simulated worker
//! pulls request messages and answers them by serial number.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use super::ccb::Ccb;
use super::channel::PullError;
use super::devctrl::*;
use super::driver::{decode_mounts, Driver};
use super::event::{decode_batch, event_flags, response_flags, EventRequest, EventResponse};
use super::event::RequestBody;
use super::fileinfo::{encode_rename_information, FILE_RENAME_INFORMATION};
use super::metrics::MetricsSnapshot;
use super::options::{MountFlags, MountOptions, EVENT_CONTEXT_MAX_SIZE, KEEPALIVE_FILE_NAME};
use super::volume::FILE_FS_DEVICE_INFORMATION;
use super::Dcb;
use crate::fsrtl::{fsctl_oplock, notify_filter, oplock_break_info};
use crate::io::{
    create_disposition, create_information, create_options, file_access, file_share,
    io_cancel_irp, irp_minor, CreateParameters, FileObject, Irp, IrpParameters,
};
use crate::ke::lockorder::thread_lock_order_inversions;
use crate::ke::ManualClock;
use crate::status::*;

struct Harness {
    clock: Arc<ManualClock>,
    driver: Arc<Driver>,
    dcb: Arc<Dcb>,
}

fn mount_with(options: MountOptions) -> Harness {
    let clock = Arc::new(ManualClock::new(0));
    let driver = Driver::new();
    let dcb = driver
        .start_filesystem(options.manual(Arc::clone(&clock)))
        .expect("mount");
    Harness { clock, driver, dcb }
}

fn mount() -> Harness {
    mount_with(MountOptions::new("M:"))
}

fn status_of(irp: &Irp) -> Option<NtStatus> {
    irp.io_status().map(|s| s.status)
}

/// Everything queued for user mode right now
fn take_requests(dcb: &Dcb) -> Vec<EventRequest> {
    let mut all = Vec::new();
    loop {
        let batch = dcb.pull(1 << 20, Some(Duration::ZERO)).expect("pull");
        if batch.is_empty() {
            return all;
        }
        all.extend(decode_batch(&batch).expect("decode"));
    }
}

fn take_one(dcb: &Dcb) -> EventRequest {
    let mut requests = take_requests(dcb);
    assert_eq!(requests.len(), 1, "expected one request, got {:?}", requests);
    requests.remove(0)
}

fn create_irp(file: &Arc<FileObject>, access: u32, disposition: u32, options: u32) -> Arc<Irp> {
    Irp::new(IrpParameters::Create(CreateParameters {
        file_name: file.name().to_string(),
        desired_access: access,
        share_access: file_share::FILE_SHARE_READ | file_share::FILE_SHARE_WRITE,
        file_attributes: 0,
        create_disposition: disposition,
        create_options: options,
    }))
    .with_file_object(Arc::clone(file))
    .into_shared()
}

fn open_irp(file: &Arc<FileObject>, access: u32) -> Arc<Irp> {
    create_irp(file, access, create_disposition::FILE_OPEN, 0)
}

fn on_file(parameters: IrpParameters, file: &Arc<FileObject>) -> Arc<Irp> {
    Irp::new(parameters)
        .with_file_object(Arc::clone(file))
        .into_shared()
}

fn read_irp(file: &Arc<FileObject>, offset: i64, length: u32) -> Arc<Irp> {
    on_file(
        IrpParameters::Read {
            byte_offset: offset,
            length,
            key: 0,
        },
        file,
    )
}

fn control_irp(code: u32, input: Vec<u8>, output_length: u32) -> Arc<Irp> {
    Irp::new(IrpParameters::DeviceControl {
        io_control_code: code,
        input,
        output_length,
    })
    .into_shared()
}

fn data_response(serial: u64, payload: &[u8]) -> EventResponse {
    EventResponse::new(serial, STATUS_SUCCESS).with_payload(payload.to_vec())
}

/// Open `path` and have the worker answer with `flags`
fn open_as(h: &Harness, path: &str, access: u32, options: u32, flags: u32) -> Arc<FileObject> {
    let file = Arc::new(FileObject::new(path));
    let irp = create_irp(&file, access, create_disposition::FILE_OPEN, options);
    assert_eq!(h.dcb.dispatch(&irp), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::Create { .. }));
    let response = EventResponse::new(request.serial, STATUS_SUCCESS)
        .with_information(create_information::FILE_OPENED as u64)
        .with_context(0x77)
        .with_flags(flags);
    assert!(h.dcb.complete_response(&response));
    assert_eq!(status_of(&irp), Some(STATUS_SUCCESS));
    file
}

fn open(h: &Harness, path: &str) -> Arc<FileObject> {
    open_as(h, path, file_access::FILE_GENERIC_READ, 0, 0)
}

fn open_directory(h: &Harness, path: &str) -> Arc<FileObject> {
    open_as(
        h,
        path,
        file_access::FILE_GENERIC_READ,
        create_options::FILE_DIRECTORY_FILE,
        response_flags::DIRECTORY,
    )
}

/// Open and activate a keepalive handle
fn keepalive(h: &Harness) -> Arc<FileObject> {
    let file = Arc::new(FileObject::new(KEEPALIVE_FILE_NAME));
    let irp = open_irp(&file, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&irp), STATUS_SUCCESS);
    assert!(take_requests(&h.dcb).is_empty());

    let activate = Irp::new(IrpParameters::DeviceControl {
        io_control_code: IOCTL_ACTIVATE_KEEPALIVE,
        input: Vec::new(),
        output_length: 0,
    })
    .with_file_object(Arc::clone(&file))
    .into_shared();
    assert_eq!(h.dcb.dispatch(&activate), STATUS_SUCCESS);
    assert!(h.dcb.vcb().is_keepalive_active());
    file
}

fn ccb_of(file: &FileObject) -> Arc<Ccb> {
    file.fs_context2::<Ccb>().expect("ccb")
}

fn ccb_of_opt(file: &FileObject) -> Option<Arc<Ccb>> {
    file.fs_context2::<Ccb>()
}

// ----------------------------------------------------------------------
// Pending registry
// ----------------------------------------------------------------------

#[test]
fn test_responses_complete_by_serial() {
    let h = mount();
    let file = open(&h, "\\a");

    let first = read_irp(&file, 0, 4);
    let second = read_irp(&file, 4, 4);
    assert_eq!(h.dcb.dispatch(&first), STATUS_PENDING);
    assert_eq!(h.dcb.dispatch(&second), STATUS_PENDING);
    assert!(first.is_pending_returned());
    let requests = take_requests(&h.dcb);
    assert_eq!(requests.len(), 2);
    assert!(requests[0].serial < requests[1].serial);
    assert_eq!(requests[0].file_context, 0x77);

    let answer = data_response(requests[1].serial, b"efgh");
    assert!(h.dcb.complete_response(&answer));
    assert_eq!(status_of(&second), Some(STATUS_SUCCESS));
    assert_eq!(second.output(), b"efgh");
    assert!(!first.is_completed());
    assert_eq!(h.dcb.registry().len(), 1);

    // Same serial twice: the entry is gone
    assert!(!h.dcb.complete_response(&answer));

    // Longer payloads than asked for are cut to the request length
    let answer = data_response(requests[0].serial, b"abcdXX");
    assert!(h.dcb.complete_response(&answer));
    assert_eq!(first.output(), b"abcd");
    assert!(h.dcb.registry().is_empty());
    assert_eq!(thread_lock_order_inversions(), 0);
}

#[test]
fn test_sweep_expires_by_operation_kind() {
    let h = mount_with(MountOptions::new("M:").with_irp_timeout_ms(50));
    let _keepalive = keepalive(&h);
    let file = open(&h, "\\a");

    let read = read_irp(&file, 0, 16);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
    let pending_create = Arc::new(FileObject::new("\\b"));
    let create = open_irp(&pending_create, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    assert_eq!(take_requests(&h.dcb).len(), 2);

    h.clock.advance(49);
    assert_eq!(h.dcb.check_timeouts(), 0);
    h.clock.advance(2);
    assert_eq!(h.dcb.check_timeouts(), 2);

    assert_eq!(status_of(&read), Some(STATUS_INSUFFICIENT_RESOURCES));
    assert_eq!(status_of(&create), Some(STATUS_CANCELLED));
    // The failed create gave its FCB reference back
    let fcb = h.dcb.vcb().lookup_fcb("\\b").expect("fcb");
    assert_eq!(fcb.file_count(), 0);
    assert!(h.dcb.registry().is_empty());
    // Keepalive keeps the volume up
    assert!(!h.dcb.is_released());
    assert_eq!(h.dcb.vcb().metrics().snapshot().pending_timed_out, 2);
}

#[test]
fn test_expiry_without_keepalive_unmounts() {
    let h = mount_with(MountOptions::new("M:").with_irp_timeout_ms(50));
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 16);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);

    h.clock.advance(100);
    assert_eq!(h.dcb.check_timeouts(), 1);
    assert_eq!(status_of(&read), Some(STATUS_INSUFFICIENT_RESOURCES));
    assert!(h.dcb.is_released());
    assert_eq!(h.driver.mount_count(), 0);
}

#[test]
fn test_reset_timeout_extends_deadline() {
    let h = mount_with(MountOptions::new("M:").with_irp_timeout_ms(50));
    let _keepalive = keepalive(&h);
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 16);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;

    // Requested timeouts are clamped to the minimum
    let reset = control_irp(IOCTL_RESET_TIMEOUT, encode_reset_timeout(serial, 1), 0);
    assert_eq!(h.dcb.dispatch(&reset), STATUS_SUCCESS);
    h.clock.advance(1000);
    assert_eq!(h.dcb.check_timeouts(), 0);

    let unknown = control_irp(IOCTL_RESET_TIMEOUT, encode_reset_timeout(serial + 100, 1), 0);
    assert_eq!(h.dcb.dispatch(&unknown), STATUS_INVALID_PARAMETER);
}

#[test]
fn test_canceled_create_expires_on_next_sweep() {
    let h = mount();
    let _keepalive = keepalive(&h);
    let file = Arc::new(FileObject::new("\\c"));
    let create = open_irp(&file, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;

    // Creates carry no cancel hook; the flag is seen by the sweep
    assert!(!io_cancel_irp(&create));
    assert!(!create.is_completed());
    assert_eq!(h.dcb.check_timeouts(), 1);
    assert_eq!(status_of(&create), Some(STATUS_CANCELLED));

    let late = EventResponse::new(serial, STATUS_SUCCESS);
    assert!(!h.dcb.complete_response(&late));
    assert!(ccb_of_opt(&file).is_none());
}

#[test]
fn test_canceled_read_completes_once() {
    let h = mount();
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 16);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;

    assert!(io_cancel_irp(&read));
    assert_eq!(status_of(&read), Some(STATUS_CANCELLED));
    assert!(h.dcb.registry().is_empty());

    let late = EventResponse::new(serial, STATUS_SUCCESS).with_payload(vec![1; 16]);
    assert!(!h.dcb.complete_response(&late));
    assert_eq!(read.completion_attempts(), 1);
    assert_eq!(h.dcb.vcb().metrics().snapshot().pending_cancelled, 1);
}

#[test]
fn test_single_completion_under_races() {
    let h = mount();
    let _keepalive = keepalive(&h);
    let file = open(&h, "\\a");

    for _ in 0..50 {
        let read = read_irp(&file, 0, 4);
        assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
        let serial = take_one(&h.dcb).serial;
        let barrier = Barrier::new(3);

        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                let answer = data_response(serial, b"data");
                h.dcb.complete_response(&answer);
            });
            s.spawn(|| {
                barrier.wait();
                io_cancel_irp(&read);
            });
            s.spawn(|| {
                barrier.wait();
                h.clock.advance(60_000);
                h.dcb.check_timeouts();
            });
        });

        assert!(read.is_completed());
        assert_eq!(read.completion_attempts(), 1);
        assert!(h.dcb.registry().is_empty());
    }
    assert!(!h.dcb.is_released());
}

// ----------------------------------------------------------------------
// Router policy
// ----------------------------------------------------------------------

#[test]
fn test_read_only_volume_rejects_writes() {
    let h = mount_with(MountOptions::new("R:").with_flags(MountFlags::WRITE_PROTECT));
    let file = open(&h, "\\a");

    let write = on_file(
        IrpParameters::Write {
            byte_offset: 0,
            data: b"hello".to_vec(),
            key: 0,
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&write), STATUS_MEDIA_WRITE_PROTECTED);
    assert_eq!(status_of(&write), Some(STATUS_MEDIA_WRITE_PROTECTED));
    assert!(h.dcb.registry().is_empty());
    assert!(h.dcb.channel().is_empty());

    let other = Arc::new(FileObject::new("\\new"));
    let create = create_irp(
        &other,
        file_access::FILE_GENERIC_READ,
        create_disposition::FILE_OPEN_IF,
        0,
    );
    assert_eq!(h.dcb.dispatch(&create), STATUS_MEDIA_WRITE_PROTECTED);
    assert!(h.dcb.channel().is_empty());
}

#[test]
fn test_zero_length_transfers_stay_in_kernel() {
    let h = mount();
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 0);
    assert_eq!(h.dcb.dispatch(&read), STATUS_SUCCESS);
    let write = on_file(
        IrpParameters::Write {
            byte_offset: 0,
            data: Vec::new(),
            key: 0,
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&write), STATUS_SUCCESS);
    assert!(h.dcb.channel().is_empty());
}

#[test]
fn test_synchronous_read_moves_file_pointer() {
    let h = mount();
    let file = Arc::new(FileObject::new("\\s").synchronous());
    let irp = open_irp(&file, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&irp), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;
    assert!(h.dcb.complete_response(&EventResponse::new(serial, STATUS_SUCCESS)));

    let read = read_irp(&file, 100, 8);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert_ne!(request.flags & event_flags::SYNCHRONOUS_IO, 0);
    let answer = EventResponse::new(request.serial, STATUS_SUCCESS).with_payload(vec![7; 6]);
    assert!(h.dcb.complete_response(&answer));
    assert_eq!(file.position(), 106);
}

// ----------------------------------------------------------------------
// Control calls
// ----------------------------------------------------------------------

#[test]
fn test_large_write_is_fetched_separately() {
    let h = mount();
    let file = open_as(&h, "\\big", file_access::FILE_GENERIC_WRITE, 0, 0);
    let data = vec![0xAB; EVENT_CONTEXT_MAX_SIZE + 1];
    let write = on_file(
        IrpParameters::Write {
            byte_offset: 0,
            data: data.clone(),
            key: 0,
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&write), STATUS_PENDING);

    let header = take_one(&h.dcb);
    assert_ne!(header.flags & event_flags::LARGE_WRITE, 0);
    match &header.body {
        RequestBody::Write { length, data, .. } => {
            assert_eq!(*length as usize, EVENT_CONTEXT_MAX_SIZE + 1);
            assert!(data.is_empty());
        }
        other => panic!("unexpected body {:?}", other),
    }

    let input = header.serial.to_le_bytes().to_vec();
    let small = control_irp(IOCTL_EVENT_WRITE, input.clone(), 64);
    assert_eq!(h.dcb.dispatch(&small), STATUS_BUFFER_TOO_SMALL);
    let needed = small.information();
    assert!(needed > EVENT_CONTEXT_MAX_SIZE);

    let fetch = control_irp(IOCTL_EVENT_WRITE, input, needed as u32);
    assert_eq!(h.dcb.dispatch(&fetch), STATUS_SUCCESS);
    let (full, _) = EventRequest::decode(&fetch.output()).expect("decode");
    match full.body {
        RequestBody::Write { data: fetched, .. } => assert_eq!(fetched, data),
        other => panic!("unexpected body {:?}", other),
    }
    // Still pending until the ordinary answer
    assert!(!write.is_completed());

    let answer = EventResponse::new(header.serial, STATUS_SUCCESS)
        .with_information(data.len() as u64);
    assert!(h.dcb.complete_response(&answer));
    assert_eq!(write.information(), data.len());
    assert_eq!(h.dcb.vcb().metrics().snapshot().large_write_fetches, 2);
}

#[test]
fn test_event_wait_piggybacks_response() {
    let h = mount();
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 3);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);

    let wait = control_irp(IOCTL_EVENT_WAIT, encode_event_wait(0, None), 64 * 1024);
    assert_eq!(h.dcb.dispatch(&wait), STATUS_SUCCESS);
    let requests = decode_batch(&wait.output()).expect("decode");
    assert_eq!(requests.len(), 1);

    let answer = data_response(requests[0].serial, b"xyz");
    let wait = control_irp(IOCTL_EVENT_WAIT, encode_event_wait(0, Some(&answer)), 64 * 1024);
    assert_eq!(h.dcb.dispatch(&wait), STATUS_TIMEOUT);
    assert_eq!(status_of(&read), Some(STATUS_SUCCESS));
    assert_eq!(read.output(), b"xyz");

    let info = control_irp(IOCTL_EVENT_INFO, answer.encode(), 0);
    assert_eq!(h.dcb.dispatch(&info), STATUS_SUCCESS);

    let bogus = control_irp(IOCTL_EVENT_INFO, vec![1, 2, 3], 0);
    assert_eq!(h.dcb.dispatch(&bogus), STATUS_INFO_LENGTH_MISMATCH);
}

#[test]
fn test_event_wait_reports_needed_size() {
    let h = mount();
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 3);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);

    let wait = control_irp(IOCTL_EVENT_WAIT, encode_event_wait(0, None), 8);
    assert_eq!(h.dcb.dispatch(&wait), STATUS_BUFFER_TOO_SMALL);
    assert!(wait.information() > 8);
    // The message stays queued
    assert_eq!(h.dcb.channel().len(), 1);
}

#[test]
fn test_volume_controls() {
    let h = mount();
    let metrics = control_irp(IOCTL_GET_VOLUME_METRICS, Vec::new(), 1024);
    assert_eq!(h.dcb.dispatch(&metrics), STATUS_SUCCESS);
    assert_eq!(metrics.output().len(), MetricsSnapshot::FIELD_COUNT * 8);

    let version = control_irp(IOCTL_GET_VERSION, Vec::new(), 4);
    assert_eq!(h.dcb.dispatch(&version), STATUS_SUCCESS);
    assert_eq!(version.output(), DRIVER_VERSION.to_le_bytes());

    let unknown = control_irp(0x0022_3FFC, Vec::new(), 0);
    assert_eq!(h.dcb.dispatch(&unknown), STATUS_INVALID_DEVICE_REQUEST);

    let dir = open_directory(&h, "\\d");
    let watch = on_file(
        IrpParameters::NotifyChangeDirectory {
            completion_filter: notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME,
            watch_tree: false,
            length: 1024,
        },
        &dir,
    );
    assert_eq!(h.dcb.dispatch(&watch), STATUS_PENDING);
    let report = control_irp(
        IOCTL_NOTIFY_PATH,
        encode_notify_path(1, notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME, "\\d\\x"),
        0,
    );
    assert_eq!(h.dcb.dispatch(&report), STATUS_SUCCESS);
    assert_eq!(status_of(&watch), Some(STATUS_SUCCESS));
}

#[test]
fn test_keepalive_requires_keepalive_handle() {
    let h = mount();
    let file = open(&h, "\\a");
    let activate = Irp::new(IrpParameters::DeviceControl {
        io_control_code: IOCTL_ACTIVATE_KEEPALIVE,
        input: Vec::new(),
        output_length: 0,
    })
    .with_file_object(file)
    .into_shared();
    assert_eq!(h.dcb.dispatch(&activate), STATUS_INVALID_PARAMETER);
    assert!(!h.dcb.vcb().is_keepalive_active());
}

#[test]
fn test_keepalive_cleanup_unmounts() {
    let h = mount();
    let file = keepalive(&h);
    let cleanup = on_file(IrpParameters::Cleanup, &file);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_SUCCESS);
    assert!(h.dcb.is_released());
    assert!(h.driver.find("M:").is_none());

    let close = on_file(IrpParameters::Close, &file);
    assert_eq!(h.dcb.dispatch(&close), STATUS_SUCCESS);
}

// ----------------------------------------------------------------------
// Mount and unmount
// ----------------------------------------------------------------------

#[test]
fn test_unmount_drains_and_gates() {
    let h = mount();
    let file = open(&h, "\\a");
    let read = read_irp(&file, 0, 16);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);

    assert!(h.driver.unmount("m:"));
    assert!(!h.driver.unmount("M:"));
    assert!(!h.dcb.release());
    assert_eq!(status_of(&read), Some(STATUS_CANCELLED));
    assert!(h.dcb.registry().is_empty());

    let late = Arc::new(FileObject::new("\\late"));
    let create = open_irp(&late, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&create), STATUS_NO_SUCH_DEVICE);
    assert_eq!(
        h.dcb.pull(1024, Some(Duration::ZERO)),
        Err(PullError::Released)
    );

    // Open handles still drain
    let cleanup = on_file(IrpParameters::Cleanup, &file);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_SUCCESS);
    let close = on_file(IrpParameters::Close, &file);
    assert_eq!(h.dcb.dispatch(&close), STATUS_SUCCESS);
    assert_eq!(h.dcb.vcb().fcb_count(), 0);
}

#[test]
fn test_mount_table_and_driver_controls() {
    let driver = Driver::new();
    let options = || MountOptions::new("M:").manual(Arc::new(ManualClock::new(0)));
    let dcb = driver.start_filesystem(options()).expect("mount");
    assert_eq!(
        driver
            .start_filesystem(MountOptions::new("m:").manual(Arc::new(ManualClock::new(0))))
            .err(),
        Some(STATUS_OBJECT_NAME_COLLISION)
    );
    assert_eq!(
        driver.start_filesystem(MountOptions::new("")).err(),
        Some(STATUS_INVALID_PARAMETER)
    );
    let network = driver
        .start_filesystem(
            MountOptions::new("N:")
                .with_unc_name("\\server\\share")
                .manual(Arc::new(ManualClock::new(0))),
        )
        .expect("mount");
    assert_ne!(dcb.mount_id(), network.mount_id());

    let list = control_irp(IOCTL_GET_MOUNT_LIST, Vec::new(), 4096);
    assert_eq!(driver.device_control(&list), STATUS_SUCCESS);
    let mounts = decode_mounts(&list.output()).expect("decode");
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[1].unc_name.as_deref(), Some("\\server\\share"));
    assert_eq!(mounts, driver.mounts());

    let version = control_irp(IOCTL_GET_VERSION, Vec::new(), 4);
    assert_eq!(driver.device_control(&version), STATUS_SUCCESS);
    assert_eq!(version.output(), DRIVER_VERSION.to_le_bytes());

    let mut name = super::event::WireWriter::default();
    name.string("n:");
    let unmount = control_irp(IOCTL_UNMOUNT, name.into_inner(), 0);
    assert_eq!(driver.device_control(&unmount), STATUS_SUCCESS);
    assert!(network.is_released());
    let mut name = super::event::WireWriter::default();
    name.string("n:");
    let again = control_irp(IOCTL_UNMOUNT, name.into_inner(), 0);
    assert_eq!(driver.device_control(&again), STATUS_OBJECT_NAME_NOT_FOUND);

    let not_control = Irp::new(IrpParameters::FlushBuffers).into_shared();
    assert_eq!(driver.device_control(&not_control), STATUS_INVALID_DEVICE_REQUEST);

    assert_eq!(driver.shutdown(), 1);
    assert_eq!(driver.mount_count(), 0);
    assert!(dcb.is_released());
}

// ----------------------------------------------------------------------
// Handles, names and FCB lifetime
// ----------------------------------------------------------------------

#[test]
fn test_cleanup_and_close_release_fcb() {
    let h = mount();
    let file = open(&h, "\\a");
    let ccb = ccb_of(&file);
    let fcb = Arc::clone(ccb.fcb());
    assert_eq!(fcb.file_count(), 1);
    assert_eq!(fcb.open_handles(), 1);
    assert!(ccb.holds_reference());

    let cleanup = on_file(IrpParameters::Cleanup, &file);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::Cleanup { .. }));
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&cleanup), Some(STATUS_SUCCESS));
    assert_eq!(fcb.open_handles(), 0);

    // A second cleanup of the same handle is a no-op
    let again = on_file(IrpParameters::Cleanup, &file);
    assert_eq!(h.dcb.dispatch(&again), STATUS_SUCCESS);

    let close = on_file(IrpParameters::Close, &file);
    assert_eq!(h.dcb.dispatch(&close), STATUS_SUCCESS);
    assert!(matches!(take_one(&h.dcb).body, RequestBody::Close { .. }));
    assert!(!ccb.holds_reference());
    assert_eq!(fcb.file_count(), 0);
    assert!(fcb.is_gc_pending());
    assert_eq!(h.dcb.vcb().garbage_count(), 1);

    assert_eq!(h.dcb.vcb().collect_garbage(true), 1);
    assert!(fcb.is_deleted());
    assert_eq!(h.dcb.vcb().fcb_count(), 0);
}

#[test]
fn test_sharing_violation_is_local() {
    let h = mount();
    let file = Arc::new(FileObject::new("\\x"));
    let exclusive = Irp::new(IrpParameters::Create(CreateParameters {
        file_name: "\\x".into(),
        desired_access: file_access::FILE_GENERIC_WRITE,
        share_access: 0,
        create_disposition: create_disposition::FILE_OPEN,
        ..CreateParameters::default()
    }))
    .with_file_object(Arc::clone(&file))
    .into_shared();
    assert_eq!(h.dcb.dispatch(&exclusive), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;
    assert!(h.dcb.complete_response(&EventResponse::new(serial, STATUS_SUCCESS)));

    let second = Arc::new(FileObject::new("\\x"));
    let irp = open_irp(&second, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&irp), STATUS_SHARING_VIOLATION);
    assert!(h.dcb.channel().is_empty());
    assert_eq!(ccb_of(&file).fcb().file_count(), 1);
}

#[test]
fn test_created_file_notifies_parent_watch() {
    let h = mount();
    let dir = open_directory(&h, "\\d");
    assert!(ccb_of(&dir).fcb().is_directory());

    let watch = on_file(
        IrpParameters::NotifyChangeDirectory {
            completion_filter: notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME,
            watch_tree: false,
            length: 1024,
        },
        &dir,
    );
    assert_eq!(h.dcb.dispatch(&watch), STATUS_PENDING);

    let file = Arc::new(FileObject::new("\\d\\f"));
    let create = create_irp(
        &file,
        file_access::FILE_GENERIC_WRITE,
        create_disposition::FILE_CREATE,
        0,
    );
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;
    let response = EventResponse::new(serial, STATUS_SUCCESS)
        .with_information(create_information::FILE_CREATED as u64);
    assert!(h.dcb.complete_response(&response));
    assert_eq!(create.information(), create_information::FILE_CREATED);

    assert_eq!(status_of(&watch), Some(STATUS_SUCCESS));
    assert!(!watch.output().is_empty());

    // Cleanup of the directory handle drops its watch
    let rewatch = on_file(
        IrpParameters::NotifyChangeDirectory {
            completion_filter: notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME,
            watch_tree: false,
            length: 1024,
        },
        &dir,
    );
    assert_eq!(h.dcb.dispatch(&rewatch), STATUS_PENDING);
    let cleanup = on_file(IrpParameters::Cleanup, &dir);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_PENDING);
    assert_eq!(status_of(&rewatch), Some(STATUS_NOTIFY_CLEANUP));
}

#[test]
fn test_query_directory_keeps_pattern() {
    let h = mount();
    let dir = open_directory(&h, "\\d");
    let query = |pattern: &str, restart: bool| {
        on_file(
            IrpParameters::QueryDirectory {
                class: 1,
                length: 4096,
                pattern: Some(pattern.to_string()),
                restart_scan: restart,
                return_single_entry: false,
            },
            &dir,
        )
    };

    let first = query("*.txt", false);
    assert_eq!(h.dcb.dispatch(&first), STATUS_PENDING);
    let request = take_one(&h.dcb);
    match &request.body {
        RequestBody::QueryDirectory {
            pattern,
            file_index,
            ..
        } => {
            assert_eq!(pattern, "*.txt");
            assert_eq!(*file_index, 0);
        }
        other => panic!("unexpected body {:?}", other),
    }
    let answer = EventResponse::new(request.serial, STATUS_SUCCESS)
        .with_payload(vec![0; 24])
        .with_information(3);
    assert!(h.dcb.complete_response(&answer));

    let next = query("*.log", false);
    assert_eq!(h.dcb.dispatch(&next), STATUS_PENDING);
    let request = take_one(&h.dcb);
    match &request.body {
        RequestBody::QueryDirectory {
            pattern,
            file_index,
            ..
        } => {
            assert_eq!(pattern, "*.txt");
            assert_eq!(*file_index, 3);
        }
        other => panic!("unexpected body {:?}", other),
    }
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_NO_MORE_FILES)));

    let restart = query("*.log", true);
    assert_eq!(h.dcb.dispatch(&restart), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert_ne!(request.flags & event_flags::RESTART_SCAN, 0);
    match &request.body {
        RequestBody::QueryDirectory {
            pattern,
            file_index,
            ..
        } => {
            assert_eq!(pattern, "*.log");
            assert_eq!(*file_index, 0);
        }
        other => panic!("unexpected body {:?}", other),
    }

    let file = open(&h, "\\plain");
    let wrong = on_file(
        IrpParameters::QueryDirectory {
            class: 1,
            length: 4096,
            pattern: None,
            restart_scan: false,
            return_single_entry: false,
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&wrong), STATUS_NOT_A_DIRECTORY);
}

#[test]
fn test_rename_moves_fcb() {
    let h = mount();
    let file = open(&h, "\\a");
    let busy = open(&h, "\\busy");
    let fcb = Arc::clone(ccb_of(&file).fcb());

    let blocked = on_file(
        IrpParameters::SetInformation {
            class: FILE_RENAME_INFORMATION,
            buffer: encode_rename_information(true, "\\BUSY"),
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&blocked), STATUS_ACCESS_DENIED);
    assert!(h.dcb.channel().is_empty());

    let rename = on_file(
        IrpParameters::SetInformation {
            class: FILE_RENAME_INFORMATION,
            buffer: encode_rename_information(false, "\\b"),
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&rename), STATUS_PENDING);
    let request = take_one(&h.dcb);
    match &request.body {
        RequestBody::SetInformation { path, target, .. } => {
            assert_eq!(path, "\\a");
            assert_eq!(target, "\\b");
        }
        other => panic!("unexpected body {:?}", other),
    }
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));

    let moved = h.dcb.vcb().lookup_fcb("\\b").expect("renamed");
    assert!(Arc::ptr_eq(&moved, &fcb));
    assert!(h.dcb.vcb().lookup_fcb("\\a").is_none());
    assert_eq!(fcb.path(), "\\b");
    drop(busy);
    assert_eq!(thread_lock_order_inversions(), 0);
}

#[test]
fn test_delete_disposition_blocks_new_opens() {
    let h = mount();
    let file = open_as(&h, "\\gone", file_access::DELETE, 0, 0);
    let dispose = on_file(
        IrpParameters::SetInformation {
            class: super::fileinfo::FILE_DISPOSITION_INFORMATION,
            buffer: vec![1],
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&dispose), STATUS_PENDING);
    let serial = take_one(&h.dcb).serial;
    assert!(h.dcb.complete_response(&EventResponse::new(serial, STATUS_SUCCESS)));
    assert!(ccb_of(&file).fcb().is_delete_pending());

    let other = Arc::new(FileObject::new("\\gone"));
    let create = open_irp(&other, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&create), STATUS_DELETE_PENDING);
}

#[test]
fn test_position_information_in_kernel() {
    let h = mount();
    let file = open(&h, "\\a");
    let set = on_file(
        IrpParameters::SetInformation {
            class: super::fileinfo::FILE_POSITION_INFORMATION,
            buffer: 42u64.to_le_bytes().to_vec(),
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&set), STATUS_SUCCESS);
    let query = on_file(
        IrpParameters::QueryInformation {
            class: super::fileinfo::FILE_POSITION_INFORMATION,
            length: 8,
        },
        &file,
    );
    assert_eq!(h.dcb.dispatch(&query), STATUS_SUCCESS);
    assert_eq!(query.output(), 42u64.to_le_bytes());
    assert!(h.dcb.channel().is_empty());
}

#[test]
fn test_volume_device_information_in_kernel() {
    let h = mount();
    let query = Irp::new(IrpParameters::QueryVolumeInformation {
        class: FILE_FS_DEVICE_INFORMATION,
        length: 8,
    })
    .into_shared();
    assert_eq!(h.dcb.dispatch(&query), STATUS_SUCCESS);
    assert_eq!(query.output().len(), 8);
    assert!(h.dcb.channel().is_empty());

    let relayed =
        Irp::new(IrpParameters::QueryVolumeInformation { class: 1, length: 64 }).into_shared();
    assert_eq!(h.dcb.dispatch(&relayed), STATUS_PENDING);
    let request = take_one(&h.dcb);
    let answer = EventResponse::new(request.serial, STATUS_SUCCESS).with_payload(vec![5; 18]);
    assert!(h.dcb.complete_response(&answer));
    assert_eq!(relayed.output(), vec![5; 18]);
}

// ----------------------------------------------------------------------
// Locks and oplocks
// ----------------------------------------------------------------------

#[test]
fn test_byte_range_lock_blocks_other_handle() {
    let h = mount();
    let owner = open(&h, "\\a");
    let other = open(&h, "\\a");
    let lock = |file: &Arc<FileObject>, minor: u8| {
        on_file(
            IrpParameters::LockControl {
                minor,
                byte_offset: 0,
                length: 10,
                key: 0,
                fail_immediately: true,
                exclusive: true,
            },
            file,
        )
    };

    assert_eq!(h.dcb.dispatch(&lock(&owner, irp_minor::IRP_MN_LOCK)), STATUS_SUCCESS);
    assert_eq!(h.dcb.dispatch(&lock(&other, irp_minor::IRP_MN_LOCK)), STATUS_LOCK_NOT_GRANTED);

    let read = read_irp(&other, 5, 4);
    assert_eq!(h.dcb.dispatch(&read), STATUS_FILE_LOCK_CONFLICT);
    // The owner reads through its own lock
    let own = read_irp(&owner, 5, 4);
    assert_eq!(h.dcb.dispatch(&own), STATUS_PENDING);
    take_requests(&h.dcb);

    assert_eq!(
        h.dcb.dispatch(&lock(&owner, irp_minor::IRP_MN_UNLOCK_SINGLE)),
        STATUS_SUCCESS
    );
    let read = read_irp(&other, 5, 4);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
}

#[test]
fn test_overlapping_shared_locks_conflict() {
    let h = mount();
    let first = open(&h, "\\a");
    let second = open(&h, "\\a");
    let shared = |file: &Arc<FileObject>, offset: i64| {
        on_file(
            IrpParameters::LockControl {
                minor: irp_minor::IRP_MN_LOCK,
                byte_offset: offset,
                length: 10,
                key: 0,
                fail_immediately: true,
                exclusive: false,
            },
            file,
        )
    };

    assert_eq!(h.dcb.dispatch(&shared(&first, 0)), STATUS_SUCCESS);
    assert_eq!(h.dcb.dispatch(&shared(&second, 0)), STATUS_LOCK_NOT_GRANTED);
    assert_eq!(h.dcb.dispatch(&shared(&second, 5)), STATUS_LOCK_NOT_GRANTED);
    // Past the end of the first range there is nothing to overlap
    assert_eq!(h.dcb.dispatch(&shared(&second, 10)), STATUS_SUCCESS);

    // A shared range still lets the other handle read
    let read = read_irp(&second, 0, 4);
    assert_eq!(h.dcb.dispatch(&read), STATUS_PENDING);
    assert_eq!(take_requests(&h.dcb).len(), 1);
    assert!(h.dcb.channel().is_empty());
}

#[test]
fn test_user_mode_locks_are_relayed() {
    let h = mount_with(MountOptions::new("M:").with_flags(MountFlags::FILELOCK_USER_MODE));
    let file = open(&h, "\\a");
    let lock = Irp::new(IrpParameters::LockControl {
        minor: irp_minor::IRP_MN_LOCK,
        byte_offset: 0,
        length: 10,
        key: 0,
        fail_immediately: true,
        exclusive: true,
    })
    .with_file_object(file)
    .with_process_id(4242)
    .into_shared();
    assert_eq!(h.dcb.dispatch(&lock), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert_eq!(request.process_id, 4242);
    assert_ne!(request.flags & event_flags::EXCLUSIVE_LOCK, 0);
    assert_ne!(request.flags & event_flags::FAIL_IMMEDIATELY, 0);
}

#[test]
fn test_oplock_break_defers_create_until_ack() {
    let h = mount();
    let holder = open(&h, "\\a");
    let fsctl = |code: u32| {
        on_file(
            IrpParameters::FileSystemControl {
                fs_control_code: code,
                input: Vec::new(),
                output_length: 0,
            },
            &holder,
        )
    };

    let oplock = fsctl(fsctl_oplock::FSCTL_REQUEST_OPLOCK_LEVEL_1);
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);
    assert!(!oplock.is_completed());

    // A second open has to wait for the holder to give the oplock up
    let file = Arc::new(FileObject::new("\\a"));
    let create = open_irp(&file, file_access::FILE_GENERIC_WRITE);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    assert!(h.dcb.channel().is_empty());
    assert_eq!(status_of(&oplock), Some(STATUS_SUCCESS));
    assert_eq!(oplock.information(), oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE);

    let ack = fsctl(fsctl_oplock::FSCTL_OPLOCK_BREAK_ACK_NO_2);
    assert_eq!(h.dcb.dispatch(&ack), STATUS_SUCCESS);
    assert_eq!(h.dcb.retry_count(), 1);

    assert_eq!(h.dcb.process_retries(), 1);
    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::Create { .. }));
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&create), Some(STATUS_SUCCESS));

    let snapshot = h.dcb.vcb().metrics().snapshot();
    assert_eq!(snapshot.oplock_deferrals, 1);
    assert_eq!(snapshot.retries, 1);
}

fn oplock_fsctl(file: &Arc<FileObject>, code: u32) -> Arc<Irp> {
    on_file(
        IrpParameters::FileSystemControl {
            fs_control_code: code,
            input: Vec::new(),
            output_length: 0,
        },
        file,
    )
}

fn set_security_irp(file: &Arc<FileObject>) -> Arc<Irp> {
    on_file(
        IrpParameters::SetSecurity {
            security_information: 4,
            descriptor: vec![1, 0, 4, 0x80],
        },
        file,
    )
}

#[test]
fn test_set_security_breaks_level2_oplock() {
    let h = mount();
    let holder = open(&h, "\\a");
    let other = open(&h, "\\a");

    let oplock = oplock_fsctl(&holder, fsctl_oplock::FSCTL_REQUEST_OPLOCK_LEVEL_2);
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);
    assert!(!oplock.is_completed());

    let set = set_security_irp(&other);
    assert_eq!(h.dcb.dispatch(&set), STATUS_PENDING);
    assert_eq!(status_of(&oplock), Some(STATUS_SUCCESS));
    assert_eq!(oplock.information(), oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE);
    assert_eq!(ccb_of(&holder).fcb().oplock.lock().level2_count(), 0);

    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::SetSecurity { .. }));
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&set), Some(STATUS_SUCCESS));
}

#[test]
fn test_set_security_waits_for_exclusive_break() {
    let h = mount();
    let holder = open(&h, "\\a");
    let oplock = oplock_fsctl(&holder, fsctl_oplock::FSCTL_REQUEST_FILTER_OPLOCK);
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);

    // Opening does not break a filter oplock, changing security does
    let other = open(&h, "\\a");
    let set = set_security_irp(&other);
    assert_eq!(h.dcb.dispatch(&set), STATUS_PENDING);
    assert!(h.dcb.channel().is_empty());
    assert!(!set.is_completed());
    assert_eq!(oplock.information(), oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE);

    let ack = oplock_fsctl(&holder, fsctl_oplock::FSCTL_OPLOCK_BREAK_ACK_NO_2);
    assert_eq!(h.dcb.dispatch(&ack), STATUS_SUCCESS);
    assert_eq!(h.dcb.process_retries(), 1);
    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::SetSecurity { .. }));
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&set), Some(STATUS_SUCCESS));
    assert_eq!(h.dcb.vcb().metrics().snapshot().oplock_deferrals, 1);
}

#[test]
fn test_last_handle_cleanup_releases_batch_oplock() {
    let h = mount();
    let holder = open(&h, "\\a");
    let oplock = oplock_fsctl(&holder, fsctl_oplock::FSCTL_REQUEST_BATCH_OPLOCK);
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);

    // The holder closing its own handle is never held up by its oplock
    let cleanup = on_file(IrpParameters::Cleanup, &holder);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_PENDING);
    assert_eq!(status_of(&oplock), Some(STATUS_SUCCESS));
    assert!(!ccb_of(&holder).fcb().oplock.lock().is_oplock_held());

    let request = take_one(&h.dcb);
    assert!(matches!(request.body, RequestBody::Cleanup { .. }));
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&cleanup), Some(STATUS_SUCCESS));
    assert_eq!(h.dcb.vcb().metrics().snapshot().oplock_deferrals, 0);
}

#[test]
fn test_unmount_cancels_oplock_waiters() {
    let h = mount();
    let holder = open(&h, "\\a");
    let oplock = on_file(
        IrpParameters::FileSystemControl {
            fs_control_code: fsctl_oplock::FSCTL_REQUEST_BATCH_OPLOCK,
            input: Vec::new(),
            output_length: 0,
        },
        &holder,
    );
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);

    let file = Arc::new(FileObject::new("\\a"));
    let create = open_irp(&file, file_access::FILE_GENERIC_WRITE);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);

    assert!(h.dcb.release());
    assert_eq!(status_of(&create), Some(STATUS_CANCELLED));
}

// ----------------------------------------------------------------------
// Background threads (wall clock)
// ----------------------------------------------------------------------

fn mount_threaded(options: MountOptions) -> Harness {
    let driver = Driver::new();
    let dcb = driver.start_filesystem(options).expect("mount");
    Harness {
        clock: Arc::new(ManualClock::new(0)),
        driver,
        dcb,
    }
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() >= limit {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn test_timeout_thread_expires_create_and_unmounts() {
    let mut options = MountOptions::new("T:").with_irp_timeout_ms(50).with_gc_interval_ms(0);
    options.timeout_check_interval_ms = 10;
    let h = mount_threaded(options);
    assert_eq!(h.dcb.background_thread_count(), 1);

    let file = Arc::new(FileObject::new("\\slow"));
    let create = open_irp(&file, file_access::FILE_GENERIC_READ);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    assert!(matches!(take_one(&h.dcb).body, RequestBody::Create { .. }));

    // Nobody answers and there is no keepalive handle
    let expired = wait_until(Duration::from_secs(5), || {
        create.is_completed() && h.driver.mount_count() == 0
    });
    assert!(expired);
    assert_eq!(status_of(&create), Some(STATUS_CANCELLED));
    assert!(h.dcb.is_released());
    // The sweep released the volume from its own thread
    assert!(wait_until(Duration::from_secs(5), || h.dcb.background_thread_count() == 0));
    assert!(!h.dcb.release());
}

#[test]
fn test_collector_thread_deletes_after_grace() {
    let h = mount_threaded(MountOptions::new("G:").with_gc_interval_ms(20));
    assert_eq!(h.dcb.background_thread_count(), 2);
    let file = open(&h, "\\a");
    let fcb = Arc::clone(ccb_of(&file).fcb());

    let cleanup = on_file(IrpParameters::Cleanup, &file);
    assert_eq!(h.dcb.dispatch(&cleanup), STATUS_PENDING);
    let request = take_one(&h.dcb);
    assert!(h.dcb.complete_response(&EventResponse::new(request.serial, STATUS_SUCCESS)));

    let parked = Instant::now();
    let close = on_file(IrpParameters::Close, &file);
    assert_eq!(h.dcb.dispatch(&close), STATUS_SUCCESS);
    take_requests(&h.dcb);

    assert!(wait_until(Duration::from_secs(5), || h.dcb.vcb().fcb_count() == 0));
    // One pass grants grace, the next deletes
    assert!(parked.elapsed() >= Duration::from_millis(20));
    assert!(fcb.is_deleted());
    let snapshot = h.dcb.vcb().metrics().snapshot();
    assert!(snapshot.gc_cycles >= 2);
    assert_eq!(snapshot.gc_collected, 1);

    assert!(h.dcb.release());
    assert_eq!(h.dcb.background_thread_count(), 0);
}

#[test]
fn test_retry_wakes_timeout_thread() {
    let mut options = MountOptions::new("R:").with_gc_interval_ms(0);
    options.timeout_check_interval_ms = 60_000;
    let h = mount_threaded(options);
    let holder = open(&h, "\\a");
    let oplock = oplock_fsctl(&holder, fsctl_oplock::FSCTL_REQUEST_OPLOCK_LEVEL_1);
    assert_eq!(h.dcb.dispatch(&oplock), STATUS_PENDING);

    let file = Arc::new(FileObject::new("\\a"));
    let create = open_irp(&file, file_access::FILE_GENERIC_WRITE);
    assert_eq!(h.dcb.dispatch(&create), STATUS_PENDING);
    assert!(h.dcb.channel().is_empty());

    // The acknowledgement queues a retry and the thread picks it up at once
    let ack = oplock_fsctl(&holder, fsctl_oplock::FSCTL_OPLOCK_BREAK_ACK_NO_2);
    assert_eq!(h.dcb.dispatch(&ack), STATUS_SUCCESS);
    let batch = h.dcb.pull(1 << 20, Some(Duration::from_secs(5))).expect("pull");
    let requests = decode_batch(&batch).expect("decode");
    assert_eq!(requests.len(), 1);
    assert!(matches!(requests[0].body, RequestBody::Create { .. }));
    assert_eq!(h.dcb.retry_count(), 0);
    assert!(h.dcb.complete_response(&EventResponse::new(requests[0].serial, STATUS_SUCCESS)));
    assert_eq!(status_of(&create), Some(STATUS_SUCCESS));

    // Release does not wait out the sweep interval
    let started = Instant::now();
    assert!(h.dcb.release());
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(h.dcb.background_thread_count(), 0);
}
