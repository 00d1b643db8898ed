//! Event Protocol Codec
//!
//! Request messages go from the kernel to user mode, response messages
//! come back. Both are little-endian, start with a fixed 40-byte header,
//! and are padded to 8 bytes so several can be packed into one pull.
//!
//! # Request layout
//! ```text
//! 0   u32  length           total bytes including padding
//! 4   u32  mount_id
//! 8   u64  serial
//! 16  u8   major function
//! 17  u8   minor function
//! 18  u16  reserved
//! 20  u32  flags            event_flags::*
//! 24  u32  process_id
//! 28  u32  reserved
//! 32  u64  file_context     opaque value user mode stored on the handle
//! 40  ...  per-operation fixed fields, then the variable tail
//! ```
//! Tail strings are `u32 byte_length` + UTF-16LE; tail blobs are
//! `u32 byte_length` + bytes.
//!
//! # Response layout
//! ```text
//! 0   u32  length           total bytes including padding
//! 4   i32  status
//! 8   u64  serial
//! 16  u64  context          new file_context for the handle
//! 24  u64  information      bytes, create disposition, next dir index
//! 32  u32  flags            response_flags::*
//! 36  u32  payload_length
//! 40  ...  payload
//! ```
//!
//! Any size inconsistency in bytes coming from user mode is rejected with
//! STATUS_INFO_LENGTH_MISMATCH before anything is applied.

use crate::io::IrpMajorFunction;
use crate::status::{
    NtStatus, STATUS_INFO_LENGTH_MISMATCH, STATUS_INSUFFICIENT_RESOURCES,
    STATUS_OBJECT_NAME_INVALID,
};

pub const REQUEST_HEADER_SIZE: usize = 40;
pub const RESPONSE_HEADER_SIZE: usize = 40;
pub const MESSAGE_ALIGNMENT: usize = 8;

/// Per-call request flags
pub mod event_flags {
    pub const PAGING_IO: u32 = 0x0001;
    pub const NOCACHE: u32 = 0x0002;
    pub const SYNCHRONOUS_IO: u32 = 0x0004;
    pub const WRITE_TO_END_OF_FILE: u32 = 0x0008;
    /// Write payload withheld; fetch it with the fetch-write call
    pub const LARGE_WRITE: u32 = 0x0010;
    pub const DELETE_ON_CLOSE: u32 = 0x0020;
    pub const CASE_SENSITIVE: u32 = 0x0040;
    pub const RESTART_SCAN: u32 = 0x0080;
    pub const RETURN_SINGLE_ENTRY: u32 = 0x0100;
    /// Handle refers to a directory
    pub const DIRECTORY: u32 = 0x0200;
    pub const FAIL_IMMEDIATELY: u32 = 0x0400;
    pub const EXCLUSIVE_LOCK: u32 = 0x0800;
    pub const REPLACE_IF_EXISTS: u32 = 0x1000;
}

/// Response flags
pub mod response_flags {
    /// The opened object is a directory
    pub const DIRECTORY: u32 = 0x0001;
}

// ============================================================================
// Wire primitives
// ============================================================================

/// Little-endian message builder
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Allocate up front; failure is resource exhaustion
    pub fn with_capacity(capacity: usize) -> Result<Self, NtStatus> {
        let mut buf = Vec::new();
        buf.try_reserve(capacity)
            .map_err(|_| STATUS_INSUFFICIENT_RESOURCES)?;
        Ok(Self { buf })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length-prefixed UTF-16LE
    pub fn string(&mut self, s: &str) -> &mut Self {
        let at = self.buf.len();
        self.u32(0);
        for unit in s.encode_utf16() {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        let bytes = (self.buf.len() - at - 4) as u32;
        self.patch_u32(at, bytes);
        self
    }

    /// Length-prefixed bytes
    pub fn blob(&mut self, data: &[u8]) -> &mut Self {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn pad_to(&mut self, alignment: usize) -> &mut Self {
        while self.buf.len() % alignment != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian reader
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], NtStatus> {
        if self.remaining() < n {
            return Err(STATUS_INFO_LENGTH_MISMATCH);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], NtStatus> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, NtStatus> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, NtStatus> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, NtStatus> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, NtStatus> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, NtStatus> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Result<i64, NtStatus> {
        self.array().map(i64::from_le_bytes)
    }

    pub fn string(&mut self) -> Result<String, NtStatus> {
        let len = self.u32()? as usize;
        if len % 2 != 0 {
            return Err(STATUS_INFO_LENGTH_MISMATCH);
        }
        let units: Vec<u16> = self
            .take(len)?
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| STATUS_OBJECT_NAME_INVALID)
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, NtStatus> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn utf16_len(s: &str) -> usize {
    4 + s.encode_utf16().count() * 2
}

// ============================================================================
// Request messages
// ============================================================================

/// Operation-specific part of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Create {
        desired_access: u32,
        file_attributes: u32,
        share_access: u32,
        create_disposition: u32,
        create_options: u32,
        path: String,
    },
    Cleanup {
        path: String,
    },
    Close {
        path: String,
    },
    Read {
        offset: i64,
        length: u32,
        path: String,
    },
    Write {
        offset: i64,
        /// Bytes to write; the payload itself is empty for a large write
        length: u32,
        path: String,
        data: Vec<u8>,
    },
    QueryInformation {
        class: u32,
        length: u32,
        path: String,
    },
    SetInformation {
        class: u32,
        path: String,
        buffer: Vec<u8>,
        /// Normalized target of a rename
        target: String,
    },
    QueryDirectory {
        class: u32,
        length: u32,
        file_index: u64,
        path: String,
        pattern: String,
    },
    QueryVolume {
        class: u32,
        length: u32,
    },
    SetVolume {
        class: u32,
        buffer: Vec<u8>,
    },
    QuerySecurity {
        security_information: u32,
        length: u32,
        path: String,
    },
    SetSecurity {
        security_information: u32,
        path: String,
        descriptor: Vec<u8>,
    },
    Flush {
        path: String,
    },
    LockControl {
        offset: i64,
        length: i64,
        key: u32,
        path: String,
    },
}

impl RequestBody {
    pub fn major(&self) -> IrpMajorFunction {
        match self {
            Self::Create { .. } => IrpMajorFunction::Create,
            Self::Cleanup { .. } => IrpMajorFunction::Cleanup,
            Self::Close { .. } => IrpMajorFunction::Close,
            Self::Read { .. } => IrpMajorFunction::Read,
            Self::Write { .. } => IrpMajorFunction::Write,
            Self::QueryInformation { .. } => IrpMajorFunction::QueryInformation,
            Self::SetInformation { .. } => IrpMajorFunction::SetInformation,
            Self::QueryDirectory { .. } => IrpMajorFunction::DirectoryControl,
            Self::QueryVolume { .. } => IrpMajorFunction::QueryVolumeInformation,
            Self::SetVolume { .. } => IrpMajorFunction::SetVolumeInformation,
            Self::QuerySecurity { .. } => IrpMajorFunction::QuerySecurity,
            Self::SetSecurity { .. } => IrpMajorFunction::SetSecurity,
            Self::Flush { .. } => IrpMajorFunction::FlushBuffers,
            Self::LockControl { .. } => IrpMajorFunction::LockControl,
        }
    }

    fn tail_size(&self) -> usize {
        match self {
            Self::Create { path, .. }
            | Self::Cleanup { path }
            | Self::Close { path }
            | Self::Read { path, .. }
            | Self::QueryInformation { path, .. }
            | Self::QuerySecurity { path, .. }
            | Self::Flush { path }
            | Self::LockControl { path, .. } => utf16_len(path),
            Self::Write { path, data, .. } => utf16_len(path) + 4 + data.len(),
            Self::SetInformation {
                path,
                buffer,
                target,
                ..
            } => utf16_len(path) + 4 + buffer.len() + utf16_len(target),
            Self::QueryDirectory { path, pattern, .. } => utf16_len(path) + utf16_len(pattern),
            Self::QueryVolume { .. } => 0,
            Self::SetVolume { buffer, .. } => 4 + buffer.len(),
            Self::SetSecurity {
                path, descriptor, ..
            } => utf16_len(path) + 4 + descriptor.len(),
        }
    }

    fn encode(&self, w: &mut WireWriter) {
        match self {
            Self::Create {
                desired_access,
                file_attributes,
                share_access,
                create_disposition,
                create_options,
                path,
            } => {
                w.u32(*desired_access)
                    .u32(*file_attributes)
                    .u32(*share_access)
                    .u32(*create_disposition)
                    .u32(*create_options)
                    .u32(0)
                    .string(path);
            }
            Self::Cleanup { path } | Self::Close { path } | Self::Flush { path } => {
                w.string(path);
            }
            Self::Read {
                offset,
                length,
                path,
            } => {
                w.i64(*offset).u32(*length).u32(0).string(path);
            }
            Self::Write {
                offset,
                length,
                path,
                data,
            } => {
                w.i64(*offset).u32(*length).u32(0).string(path).blob(data);
            }
            Self::QueryInformation {
                class,
                length,
                path,
            } => {
                w.u32(*class).u32(*length).string(path);
            }
            Self::SetInformation {
                class,
                path,
                buffer,
                target,
            } => {
                w.u32(*class).u32(0).string(path).blob(buffer).string(target);
            }
            Self::QueryDirectory {
                class,
                length,
                file_index,
                path,
                pattern,
            } => {
                w.u32(*class)
                    .u32(*length)
                    .u64(*file_index)
                    .string(path)
                    .string(pattern);
            }
            Self::QueryVolume { class, length } => {
                w.u32(*class).u32(*length);
            }
            Self::SetVolume { class, buffer } => {
                w.u32(*class).u32(0).blob(buffer);
            }
            Self::QuerySecurity {
                security_information,
                length,
                path,
            } => {
                w.u32(*security_information).u32(*length).string(path);
            }
            Self::SetSecurity {
                security_information,
                path,
                descriptor,
            } => {
                w.u32(*security_information)
                    .u32(0)
                    .string(path)
                    .blob(descriptor);
            }
            Self::LockControl {
                offset,
                length,
                key,
                path,
            } => {
                w.i64(*offset).i64(*length).u32(*key).u32(0).string(path);
            }
        }
    }

    fn decode(major: IrpMajorFunction, r: &mut WireReader<'_>) -> Result<Self, NtStatus> {
        Ok(match major {
            IrpMajorFunction::Create => {
                let desired_access = r.u32()?;
                let file_attributes = r.u32()?;
                let share_access = r.u32()?;
                let create_disposition = r.u32()?;
                let create_options = r.u32()?;
                r.u32()?;
                Self::Create {
                    desired_access,
                    file_attributes,
                    share_access,
                    create_disposition,
                    create_options,
                    path: r.string()?,
                }
            }
            IrpMajorFunction::Cleanup => Self::Cleanup { path: r.string()? },
            IrpMajorFunction::Close => Self::Close { path: r.string()? },
            IrpMajorFunction::FlushBuffers => Self::Flush { path: r.string()? },
            IrpMajorFunction::Read => {
                let offset = r.i64()?;
                let length = r.u32()?;
                r.u32()?;
                Self::Read {
                    offset,
                    length,
                    path: r.string()?,
                }
            }
            IrpMajorFunction::Write => {
                let offset = r.i64()?;
                let length = r.u32()?;
                r.u32()?;
                Self::Write {
                    offset,
                    length,
                    path: r.string()?,
                    data: r.blob()?,
                }
            }
            IrpMajorFunction::QueryInformation => Self::QueryInformation {
                class: r.u32()?,
                length: r.u32()?,
                path: r.string()?,
            },
            IrpMajorFunction::SetInformation => {
                let class = r.u32()?;
                r.u32()?;
                Self::SetInformation {
                    class,
                    path: r.string()?,
                    buffer: r.blob()?,
                    target: r.string()?,
                }
            }
            IrpMajorFunction::DirectoryControl => Self::QueryDirectory {
                class: r.u32()?,
                length: r.u32()?,
                file_index: r.u64()?,
                path: r.string()?,
                pattern: r.string()?,
            },
            IrpMajorFunction::QueryVolumeInformation => Self::QueryVolume {
                class: r.u32()?,
                length: r.u32()?,
            },
            IrpMajorFunction::SetVolumeInformation => {
                let class = r.u32()?;
                r.u32()?;
                Self::SetVolume {
                    class,
                    buffer: r.blob()?,
                }
            }
            IrpMajorFunction::QuerySecurity => Self::QuerySecurity {
                security_information: r.u32()?,
                length: r.u32()?,
                path: r.string()?,
            },
            IrpMajorFunction::SetSecurity => {
                let security_information = r.u32()?;
                r.u32()?;
                Self::SetSecurity {
                    security_information,
                    path: r.string()?,
                    descriptor: r.blob()?,
                }
            }
            IrpMajorFunction::LockControl => {
                let offset = r.i64()?;
                let length = r.i64()?;
                let key = r.u32()?;
                r.u32()?;
                Self::LockControl {
                    offset,
                    length,
                    key,
                    path: r.string()?,
                }
            }
            IrpMajorFunction::DeviceControl
            | IrpMajorFunction::FileSystemControl
            | IrpMajorFunction::Shutdown => return Err(STATUS_INFO_LENGTH_MISMATCH),
        })
    }
}

/// Kernel to user request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub serial: u64,
    pub mount_id: u32,
    pub minor: u8,
    pub flags: u32,
    pub process_id: u32,
    pub file_context: u64,
    pub body: RequestBody,
}

impl EventRequest {
    pub fn major(&self) -> IrpMajorFunction {
        self.body.major()
    }

    /// Encoded size, including padding
    pub fn encoded_len(&self) -> usize {
        let raw = REQUEST_HEADER_SIZE + 48 + self.body.tail_size();
        raw.div_ceil(MESSAGE_ALIGNMENT) * MESSAGE_ALIGNMENT
    }

    /// Build the wire form
    ///
    /// Allocation failure surfaces as STATUS_INSUFFICIENT_RESOURCES.
    pub fn encode(&self) -> Result<Vec<u8>, NtStatus> {
        let mut w = WireWriter::with_capacity(self.encoded_len())?;
        w.u32(0)
            .u32(self.mount_id)
            .u64(self.serial)
            .u8(self.major() as u8)
            .u8(self.minor)
            .u16(0)
            .u32(self.flags)
            .u32(self.process_id)
            .u32(0)
            .u64(self.file_context);
        self.body.encode(&mut w);
        w.pad_to(MESSAGE_ALIGNMENT);
        let len = w.len() as u32;
        w.patch_u32(0, len);
        Ok(w.into_inner())
    }

    /// Parse one message from the front of `buf`, returning it and its size
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), NtStatus> {
        let mut r = WireReader::new(buf);
        let length = r.u32()? as usize;
        if length < REQUEST_HEADER_SIZE || length > buf.len() || length % MESSAGE_ALIGNMENT != 0 {
            return Err(STATUS_INFO_LENGTH_MISMATCH);
        }
        let mut r = WireReader::new(&buf[..length]);
        r.u32()?;
        let mount_id = r.u32()?;
        let serial = r.u64()?;
        let major = IrpMajorFunction::from_u8(r.u8()?).ok_or(STATUS_INFO_LENGTH_MISMATCH)?;
        let minor = r.u8()?;
        r.u16()?;
        let flags = r.u32()?;
        let process_id = r.u32()?;
        r.u32()?;
        let file_context = r.u64()?;
        let body = RequestBody::decode(major, &mut r)?;
        Ok((
            Self {
                serial,
                mount_id,
                minor,
                flags,
                process_id,
                file_context,
                body,
            },
            length,
        ))
    }
}

/// Split a pulled buffer into its messages
pub fn decode_batch(mut buf: &[u8]) -> Result<Vec<EventRequest>, NtStatus> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (request, used) = EventRequest::decode(buf)?;
        out.push(request);
        buf = &buf[used..];
    }
    Ok(out)
}

// ============================================================================
// Response messages
// ============================================================================

/// User to kernel response message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventResponse {
    pub serial: u64,
    pub status: NtStatus,
    pub context: u64,
    pub information: u64,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl EventResponse {
    pub fn new(serial: u64, status: NtStatus) -> Self {
        Self {
            serial,
            status,
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.information = payload.len() as u64;
        self.payload = payload;
        self
    }

    pub fn with_information(mut self, information: u64) -> Self {
        self.information = information;
        self
    }

    pub fn with_context(mut self, context: u64) -> Self {
        self.context = context;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::default();
        w.u32(0)
            .i32(self.status)
            .u64(self.serial)
            .u64(self.context)
            .u64(self.information)
            .u32(self.flags)
            .u32(self.payload.len() as u32)
            .raw(&self.payload)
            .pad_to(MESSAGE_ALIGNMENT);
        let len = w.len() as u32;
        w.patch_u32(0, len);
        w.into_inner()
    }

    /// Parse a response, rejecting any size inconsistency
    pub fn decode(buf: &[u8]) -> Result<Self, NtStatus> {
        let mut r = WireReader::new(buf);
        let length = r.u32()? as usize;
        let status = r.i32()?;
        let serial = r.u64()?;
        let context = r.u64()?;
        let information = r.u64()?;
        let flags = r.u32()?;
        let payload_len = r.u32()? as usize;

        if length < RESPONSE_HEADER_SIZE
            || length > buf.len()
            || RESPONSE_HEADER_SIZE + payload_len > length
        {
            return Err(STATUS_INFO_LENGTH_MISMATCH);
        }

        Ok(Self {
            serial,
            status,
            context,
            information,
            flags,
            payload: r.take(payload_len)?.to_vec(),
        })
    }
}
