//! NTSTATUS Codes
//!
//! Every failure in the relay pipeline is reported to the original caller as
//! exactly one NTSTATUS value. Values follow the NT layout: severity in the
//! top two bits, so errors are negative when viewed as `i32`.

/// NT status code
pub type NtStatus = i32;

pub const STATUS_SUCCESS: NtStatus = 0;
pub const STATUS_TIMEOUT: NtStatus = 0x0000_0102;
pub const STATUS_PENDING: NtStatus = 0x0000_0103;
pub const STATUS_NOTIFY_CLEANUP: NtStatus = 0x0000_010B;
pub const STATUS_NOTIFY_ENUM_DIR: NtStatus = 0x0000_010C;

pub const STATUS_BUFFER_OVERFLOW: NtStatus = 0x8000_0005u32 as i32;
pub const STATUS_NO_MORE_FILES: NtStatus = 0x8000_0006u32 as i32;

pub const STATUS_UNSUCCESSFUL: NtStatus = 0xC000_0001u32 as i32;
pub const STATUS_NOT_IMPLEMENTED: NtStatus = 0xC000_0002u32 as i32;
pub const STATUS_INFO_LENGTH_MISMATCH: NtStatus = 0xC000_0004u32 as i32;
pub const STATUS_INVALID_HANDLE: NtStatus = 0xC000_0008u32 as i32;
pub const STATUS_INVALID_PARAMETER: NtStatus = 0xC000_000Du32 as i32;
pub const STATUS_NO_SUCH_DEVICE: NtStatus = 0xC000_000Eu32 as i32;
pub const STATUS_END_OF_FILE: NtStatus = 0xC000_0011u32 as i32;
pub const STATUS_INVALID_DEVICE_REQUEST: NtStatus = 0xC000_0010u32 as i32;
pub const STATUS_ACCESS_DENIED: NtStatus = 0xC000_0022u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: NtStatus = 0xC000_0023u32 as i32;
pub const STATUS_OBJECT_NAME_INVALID: NtStatus = 0xC000_0033u32 as i32;
pub const STATUS_OBJECT_NAME_NOT_FOUND: NtStatus = 0xC000_0034u32 as i32;
pub const STATUS_OBJECT_NAME_COLLISION: NtStatus = 0xC000_0035u32 as i32;
pub const STATUS_SHARING_VIOLATION: NtStatus = 0xC000_0043u32 as i32;
pub const STATUS_DELETE_PENDING: NtStatus = 0xC000_0056u32 as i32;
pub const STATUS_FILE_LOCK_CONFLICT: NtStatus = 0xC000_0054u32 as i32;
pub const STATUS_LOCK_NOT_GRANTED: NtStatus = 0xC000_0055u32 as i32;
pub const STATUS_RANGE_NOT_LOCKED: NtStatus = 0xC000_007Eu32 as i32;
pub const STATUS_INSUFFICIENT_RESOURCES: NtStatus = 0xC000_009Au32 as i32;
pub const STATUS_MEDIA_WRITE_PROTECTED: NtStatus = 0xC000_00A2u32 as i32;
pub const STATUS_OPLOCK_NOT_GRANTED: NtStatus = 0xC000_00E2u32 as i32;
pub const STATUS_INVALID_OPLOCK_PROTOCOL: NtStatus = 0xC000_00E3u32 as i32;
pub const STATUS_INTERNAL_ERROR: NtStatus = 0xC000_00E5u32 as i32;
pub const STATUS_FILE_IS_A_DIRECTORY: NtStatus = 0xC000_00BAu32 as i32;
pub const STATUS_NOT_A_DIRECTORY: NtStatus = 0xC000_0103u32 as i32;
pub const STATUS_CANCELLED: NtStatus = 0xC000_0120u32 as i32;
pub const STATUS_FILE_CLOSED: NtStatus = 0xC000_0128u32 as i32;
pub const STATUS_DEVICE_NOT_READY: NtStatus = 0xC000_00A3u32 as i32;
pub const STATUS_VOLUME_DISMOUNTED: NtStatus = 0xC000_026Eu32 as i32;

/// True for success and informational codes
#[inline]
pub const fn nt_success(status: NtStatus) -> bool {
    status >= 0
}

/// True for warning codes (0x8xxxxxxx)
#[inline]
pub const fn nt_warning(status: NtStatus) -> bool {
    (status as u32) >> 30 == 2
}

/// True for error codes (0xCxxxxxxx)
#[inline]
pub const fn nt_error(status: NtStatus) -> bool {
    (status as u32) >> 30 == 3
}

/// Short name for a status code, for log lines
pub fn status_name(status: NtStatus) -> &'static str {
    match status {
        STATUS_SUCCESS => "STATUS_SUCCESS",
        STATUS_TIMEOUT => "STATUS_TIMEOUT",
        STATUS_PENDING => "STATUS_PENDING",
        STATUS_NOTIFY_CLEANUP => "STATUS_NOTIFY_CLEANUP",
        STATUS_BUFFER_OVERFLOW => "STATUS_BUFFER_OVERFLOW",
        STATUS_NO_MORE_FILES => "STATUS_NO_MORE_FILES",
        STATUS_INFO_LENGTH_MISMATCH => "STATUS_INFO_LENGTH_MISMATCH",
        STATUS_INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
        STATUS_NO_SUCH_DEVICE => "STATUS_NO_SUCH_DEVICE",
        STATUS_INVALID_DEVICE_REQUEST => "STATUS_INVALID_DEVICE_REQUEST",
        STATUS_BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
        STATUS_OBJECT_NAME_INVALID => "STATUS_OBJECT_NAME_INVALID",
        STATUS_OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
        STATUS_SHARING_VIOLATION => "STATUS_SHARING_VIOLATION",
        STATUS_FILE_LOCK_CONFLICT => "STATUS_FILE_LOCK_CONFLICT",
        STATUS_LOCK_NOT_GRANTED => "STATUS_LOCK_NOT_GRANTED",
        STATUS_INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
        STATUS_MEDIA_WRITE_PROTECTED => "STATUS_MEDIA_WRITE_PROTECTED",
        STATUS_CANCELLED => "STATUS_CANCELLED",
        _ if nt_error(status) => "error",
        _ if nt_warning(status) => "warning",
        _ => "informational",
    }
}
