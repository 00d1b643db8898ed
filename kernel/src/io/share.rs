//! Share Access (IoCheckShareAccess / IoUpdateShareAccess)
//!
//! Every FCB keeps counts of the opens that hold read / write / delete
//! access and of the opens that allow others to read / write / delete.
//! A new open conflicts when it wants access some existing open refuses to
//! share, or refuses to share access some existing open already holds.

use super::file::{file_access, file_share};
use crate::status::{NtStatus, STATUS_SHARING_VIOLATION};

/// The access and sharing one open contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessGrant {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub shared_read: bool,
    pub shared_write: bool,
    pub shared_delete: bool,
}

impl AccessGrant {
    /// Derive the grant from a desired-access mask and a share mask
    pub fn from_masks(desired_access: u32, share: u32) -> Self {
        use file_access::*;
        Self {
            read: desired_access & (FILE_READ_DATA | FILE_EXECUTE) != 0,
            write: desired_access & (FILE_WRITE_DATA | FILE_APPEND_DATA) != 0,
            delete: desired_access & DELETE != 0,
            shared_read: share & file_share::FILE_SHARE_READ != 0,
            shared_write: share & file_share::FILE_SHARE_WRITE != 0,
            shared_delete: share & file_share::FILE_SHARE_DELETE != 0,
        }
    }

    /// Opens that only touch attributes never take part in sharing
    pub fn is_data_access(&self) -> bool {
        self.read || self.write || self.delete
    }
}

/// SHARE_ACCESS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareAccess {
    pub open_count: u32,
    pub readers: u32,
    pub writers: u32,
    pub deleters: u32,
    pub shared_read: u32,
    pub shared_write: u32,
    pub shared_delete: u32,
}

impl ShareAccess {
    pub const fn new() -> Self {
        Self {
            open_count: 0,
            readers: 0,
            writers: 0,
            deleters: 0,
            shared_read: 0,
            shared_write: 0,
            shared_delete: 0,
        }
    }

    /// IoCheckShareAccess without update
    pub fn check(&self, grant: &AccessGrant) -> Result<(), NtStatus> {
        if !grant.is_data_access() {
            return Ok(());
        }

        let others = self.open_count;
        let conflict = (grant.read && self.shared_read < others)
            || (grant.write && self.shared_write < others)
            || (grant.delete && self.shared_delete < others)
            || (self.readers != 0 && !grant.shared_read)
            || (self.writers != 0 && !grant.shared_write)
            || (self.deleters != 0 && !grant.shared_delete);

        if conflict {
            Err(STATUS_SHARING_VIOLATION)
        } else {
            Ok(())
        }
    }

    /// IoSetShareAccess / IoUpdateShareAccess
    pub fn add(&mut self, grant: &AccessGrant) {
        if !grant.is_data_access() {
            return;
        }
        self.open_count += 1;
        self.readers += u32::from(grant.read);
        self.writers += u32::from(grant.write);
        self.deleters += u32::from(grant.delete);
        self.shared_read += u32::from(grant.shared_read);
        self.shared_write += u32::from(grant.shared_write);
        self.shared_delete += u32::from(grant.shared_delete);
    }

    /// Check and record in one step
    pub fn check_and_add(&mut self, grant: &AccessGrant) -> Result<(), NtStatus> {
        self.check(grant)?;
        self.add(grant);
        Ok(())
    }

    /// IoRemoveShareAccess
    pub fn remove(&mut self, grant: &AccessGrant) {
        if !grant.is_data_access() {
            return;
        }
        self.open_count = self.open_count.saturating_sub(1);
        self.readers = self.readers.saturating_sub(u32::from(grant.read));
        self.writers = self.writers.saturating_sub(u32::from(grant.write));
        self.deleters = self.deleters.saturating_sub(u32::from(grant.delete));
        self.shared_read = self.shared_read.saturating_sub(u32::from(grant.shared_read));
        self.shared_write = self.shared_write.saturating_sub(u32::from(grant.shared_write));
        self.shared_delete = self
            .shared_delete
            .saturating_sub(u32::from(grant.shared_delete));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_access::*;
    use file_share::*;

    #[test]
    fn test_exclusive_writer_blocks_reader() {
        let mut share = ShareAccess::new();
        let writer = AccessGrant::from_masks(FILE_WRITE_DATA, 0);
        share.check_and_add(&writer).unwrap();

        let reader = AccessGrant::from_masks(FILE_READ_DATA, FILE_SHARE_READ | FILE_SHARE_WRITE);
        assert_eq!(share.check(&reader), Err(STATUS_SHARING_VIOLATION));

        share.remove(&writer);
        assert_eq!(share, ShareAccess::new());
        assert!(share.check(&reader).is_ok());
    }

    #[test]
    fn test_compatible_sharing() {
        let mut share = ShareAccess::new();
        let a = AccessGrant::from_masks(FILE_READ_DATA, FILE_SHARE_READ);
        let b = AccessGrant::from_masks(FILE_READ_DATA, FILE_SHARE_READ | FILE_SHARE_WRITE);
        share.check_and_add(&a).unwrap();
        share.check_and_add(&b).unwrap();
        // a does not share write
        let c = AccessGrant::from_masks(FILE_WRITE_DATA, FILE_SHARE_VALID_FLAGS);
        assert!(share.check(&c).is_err());
    }

    #[test]
    fn test_attribute_only_open_ignores_sharing() {
        let mut share = ShareAccess::new();
        share
            .check_and_add(&AccessGrant::from_masks(FILE_WRITE_DATA, 0))
            .unwrap();
        let attrs = AccessGrant::from_masks(FILE_READ_ATTRIBUTES, 0);
        assert!(share.check(&attrs).is_ok());
    }
}
