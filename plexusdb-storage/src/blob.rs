//! Chained-page blob storage inside the pager file.
//!
//! Checkpoint tables (interners, durable properties) are serialized into a
//! chain of pages: `[next_page u32][len u16][data]` per page, with `next = 0`
//! terminating the chain. Writers prepare the chain first so the engine can
//! put full page images into the WAL before any page is touched.

use crate::pager::{PageId, Pager};
use crate::{Error, PAGE_SIZE, Result};

const HEADER_SIZE: usize = 4 + 2;
const MAX_DATA_PER_PAGE: usize = PAGE_SIZE - HEADER_SIZE;

/// A blob whose pages are allocated but not yet written.
#[derive(Debug)]
pub struct PreparedBlob {
    pub head: PageId,
    pub pages: Vec<(PageId, Box<[u8; PAGE_SIZE]>)>,
}

impl PreparedBlob {
    pub fn write(&self, pager: &mut Pager) -> Result<()> {
        for (pid, image) in &self.pages {
            pager.write_page(*pid, image)?;
        }
        Ok(())
    }
}

pub struct BlobStore;

impl BlobStore {
    /// Allocate a chain and build the page images for `data`.
    pub fn prepare(pager: &mut Pager, data: &[u8]) -> Result<PreparedBlob> {
        let chunk_count = data.len().div_ceil(MAX_DATA_PER_PAGE).max(1);
        let mut ids = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            ids.push(pager.allocate_page()?);
        }

        let mut pages = Vec::with_capacity(chunk_count);
        for (i, id) in ids.iter().enumerate() {
            let start = i * MAX_DATA_PER_PAGE;
            let end = data.len().min(start + MAX_DATA_PER_PAGE);
            let chunk = &data[start..end];

            let next = ids.get(i + 1).map(|p| p.as_u32()).unwrap_or(0);
            let mut image = Box::new([0u8; PAGE_SIZE]);
            image[0..4].copy_from_slice(&next.to_le_bytes());
            image[4..6].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            image[6..6 + chunk.len()].copy_from_slice(chunk);
            pages.push((*id, image));
        }

        Ok(PreparedBlob { head: ids[0], pages })
    }

    pub fn read(pager: &Pager, head: PageId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for pid in Self::chain_pages(pager, head)? {
            let page = pager.read_page(pid)?;
            let len = u16::from_le_bytes(page[4..6].try_into().unwrap()) as usize;
            if len > MAX_DATA_PER_PAGE {
                return Err(Error::StorageCorrupted("invalid blob page data length"));
            }
            out.extend_from_slice(&page[HEADER_SIZE..HEADER_SIZE + len]);
        }
        Ok(out)
    }

    /// Every page in the chain starting at `head`, cycle-checked.
    pub fn chain_pages(pager: &Pager, head: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        let mut current = head.as_u32();
        while current != 0 {
            let pid = PageId::new(current);
            if !seen.insert(current) {
                return Err(Error::StorageCorrupted("cycle detected in blob chain"));
            }
            let page = pager.read_page(pid)?;
            pages.push(pid);
            current = u32::from_le_bytes(page[0..4].try_into().unwrap());
        }
        Ok(pages)
    }

    pub fn free_chain(pager: &mut Pager, head: PageId) -> Result<()> {
        for pid in Self::chain_pages(pager, head)? {
            pager.free_page(pid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_multi_page_blob() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("blob.ndb")).unwrap();

        let data: Vec<u8> = (0..(PAGE_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();
        let blob = BlobStore::prepare(&mut pager, &data).unwrap();
        assert_eq!(blob.pages.len(), 3);
        blob.write(&mut pager).unwrap();

        let got = BlobStore::read(&pager, blob.head).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn empty_blob_occupies_one_page() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("empty.ndb")).unwrap();

        let blob = BlobStore::prepare(&mut pager, &[]).unwrap();
        blob.write(&mut pager).unwrap();
        assert_eq!(BlobStore::read(&pager, blob.head).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn free_chain_releases_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("free.ndb")).unwrap();

        let data = vec![7u8; PAGE_SIZE + 10];
        let blob = BlobStore::prepare(&mut pager, &data).unwrap();
        blob.write(&mut pager).unwrap();
        let head = blob.head;

        BlobStore::free_chain(&mut pager, head).unwrap();
        let reused = pager.allocate_page().unwrap();
        assert_eq!(reused, head);
    }
}
