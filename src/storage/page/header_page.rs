use crate::storage::page::btree_page::{read_u32, write_u32};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View of the reserved page 0: a directory of
/// `(index name, root page id)` records, one per index. Names are at
/// most 32 bytes, NUL-padded.
pub struct HeaderPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> HeaderPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn record_count(&self) -> usize {
        read_u32(self.data.as_ref(), RECORD_COUNT_OFFSET) as usize
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let index = self.find_record(name)?;
        Some(PageId(read_u32(
            self.data.as_ref(),
            record_offset(index) + NAME_SIZE,
        )))
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        let data = self.data.as_ref();
        (0..self.record_count()).find(|&i| {
            let offset = record_offset(i);
            let stored = &data[offset..offset + NAME_SIZE];
            let end = stored.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
            &stored[..end] == name.as_bytes()
        })
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HeaderPage<B> {
    pub fn init(&mut self) {
        write_u32(self.data.as_mut(), RECORD_COUNT_OFFSET, 0);
    }

    /// Adds a record. Returns false if the name is taken, too long, or
    /// the directory is full.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> bool {
        if name.len() > NAME_SIZE || self.find_record(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_HEADER_RECORDS {
            return false;
        }

        let offset = record_offset(count);
        let data = self.data.as_mut();
        data[offset..offset + NAME_SIZE].fill(0);
        data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        write_u32(data, offset + NAME_SIZE, root_id.0);
        write_u32(data, RECORD_COUNT_OFFSET, (count + 1) as u32);
        true
    }

    /// Rewrites an existing record's root page id. Returns false if the
    /// name is unknown.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> bool {
        match self.find_record(name) {
            Some(index) => {
                write_u32(
                    self.data.as_mut(),
                    record_offset(index) + NAME_SIZE,
                    root_id.0,
                );
                true
            }
            None => false,
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find_record(name) else {
            return false;
        };
        let count = self.record_count();
        let data = self.data.as_mut();
        data.copy_within(
            record_offset(index + 1)..record_offset(count),
            record_offset(index),
        );
        write_u32(data, RECORD_COUNT_OFFSET, (count - 1) as u32);
        true
    }
}

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}
