//! The image table header that begins every prefix file (§4.2), and the
//! `ImageTable` lookup structure shared by both preprocessors.

use super::le;
use crate::entity::Image;
use crate::error::TraceFormatError;

/// Images sorted by `start`, kept disjoint. Resolution is a descending
/// sweep (§4.3: "sufficient because images are sorted and disjoint and the
/// set is small") rather than a binary search — simpler, and the image
/// count per process is small enough that it doesn't matter.
#[derive(Debug, Clone, Default)]
pub struct ImageTable {
    images: Vec<Image>,
}

impl ImageTable {
    pub fn new(mut images: Vec<Image>) -> Self {
        images.sort_by_key(|i| i.start);
        Self { images }
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn by_id(&self, id: i32) -> Option<&Image> {
        self.images.iter().find(|i| i.id == id)
    }

    /// Resolve an absolute address to the image containing it, sweeping
    /// from the highest `start` downward.
    pub fn resolve(&self, addr: u64) -> Option<&Image> {
        self.images.iter().rev().find(|img| img.contains(addr))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        le::push_i32(out, self.images.len() as i32);
        for img in &self.images {
            le::push_i32(out, img.id);
            le::push_u64(out, img.start);
            le::push_u64(out, img.end);
            let name_bytes = img.name.as_bytes();
            le::push_i32(out, name_bytes.len() as i32);
            out.extend_from_slice(name_bytes);
            le::push_u8(out, img.interesting as u8);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(ImageTable, &[u8]), TraceFormatError> {
        let (count, mut rest) = le::read_i32(buf)?;
        if count < 0 {
            return Err(TraceFormatError::BadNameLength { len: count });
        }
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (id, r) = le::read_i32(rest)?;
            let (start, r) = le::read_u64(r)?;
            let (end, r) = le::read_u64(r)?;
            let (name_len, r) = le::read_i32(r)?;
            if name_len < 0 {
                return Err(TraceFormatError::BadNameLength { len: name_len });
            }
            le::need(r, name_len as usize)?;
            let (name_bytes, r) = r.split_at(name_len as usize);
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            let (interesting, r) = le::read_u8(r)?;
            images.push(Image {
                id,
                start,
                end,
                name,
                interesting: interesting != 0,
            });
            rest = r;
        }
        Ok((ImageTable::new(images), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(id: i32, start: u64, end: u64, interesting: bool) -> Image {
        Image {
            id,
            start,
            end,
            name: format!("img{id}"),
            interesting,
        }
    }

    #[test]
    fn roundtrips_image_table() {
        let table = ImageTable::new(vec![
            img(0, 0x1000, 0x2000, true),
            img(1, 0x5000, 0x6000, false),
        ]);
        let mut buf = Vec::new();
        table.encode(&mut buf);
        let (decoded, rest) = ImageTable::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.images().len(), 2);
        assert_eq!(decoded.images()[0].start, 0x1000);
    }

    #[test]
    fn resolves_addresses_to_disjoint_images() {
        let table = ImageTable::new(vec![
            img(0, 0x1000, 0x2000, true),
            img(1, 0x5000, 0x6000, false),
        ]);
        assert_eq!(table.resolve(0x1500).unwrap().id, 0);
        assert_eq!(table.resolve(0x5800).unwrap().id, 1);
        assert!(table.resolve(0x3000).is_none());
    }

    #[test]
    fn empty_table_roundtrips() {
        let table = ImageTable::new(vec![]);
        let mut buf = Vec::new();
        table.encode(&mut buf);
        let (decoded, rest) = ImageTable::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert!(decoded.images().is_empty());
    }
}
