//! ISO-BMFF box walking.

use super::SourceError;

/// One box: its type and body (header excluded), with the body's absolute
/// offset in the file.
#[derive(Debug, Clone, Copy)]
pub struct Atom<'a> {
    pub kind: [u8; 4],
    pub body: &'a [u8],
    pub body_offset: usize,
}

impl<'a> Atom<'a> {
    /// Box type as text for diagnostics.
    pub fn kind_str(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }

    /// Child boxes, for container boxes such as `moov` or `trak`.
    pub fn children(&self) -> AtomIter<'a> {
        AtomIter::new(self.body, self.body_offset)
    }

    /// Child boxes starting `skip` bytes into the body (sample entries,
    /// full boxes with a fixed prefix).
    pub fn children_after(&self, skip: usize) -> Result<AtomIter<'a>, SourceError> {
        let rest = self.body.get(skip..).ok_or_else(|| SourceError::Malformed {
            reason: format!("{} box shorter than {skip} bytes", self.kind_str()),
        })?;
        Ok(AtomIter::new(rest, self.body_offset + skip))
    }

    /// First child of the given type.
    ///
    /// # Errors
    ///
    /// - `SourceError::Malformed` - A child box header is corrupt
    pub fn child(&self, kind: &[u8; 4]) -> Result<Option<Atom<'a>>, SourceError> {
        find_atom(self.children(), kind)
    }

    /// First child of the given type, required.
    ///
    /// # Errors
    ///
    /// - `SourceError::Malformed` - Missing child or corrupt header
    pub fn require(&self, kind: &[u8; 4]) -> Result<Atom<'a>, SourceError> {
        self.child(kind)?.ok_or_else(|| SourceError::Malformed {
            reason: format!(
                "{} box has no {} child",
                self.kind_str(),
                String::from_utf8_lossy(kind)
            ),
        })
    }
}

/// Iterator over sibling boxes. Stops after the first error.
#[derive(Debug, Clone)]
pub struct AtomIter<'a> {
    data: &'a [u8],
    pos: usize,
    base_offset: usize,
    failed: bool,
}

impl<'a> AtomIter<'a> {
    pub fn new(data: &'a [u8], base_offset: usize) -> Self {
        Self {
            data,
            pos: 0,
            base_offset,
            failed: false,
        }
    }

    fn read_next(&mut self) -> Result<Atom<'a>, SourceError> {
        let remaining = &self.data[self.pos..];
        if remaining.len() < 8 {
            return Err(SourceError::Malformed {
                reason: format!("truncated box header at offset {}", self.base_offset + self.pos),
            });
        }

        let size32 = u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]);
        let kind = [remaining[4], remaining[5], remaining[6], remaining[7]];

        let (header_len, size) = match size32 {
            0 => (8, remaining.len()),
            1 => {
                if remaining.len() < 16 {
                    return Err(SourceError::Malformed {
                        reason: "truncated 64-bit box size".to_string(),
                    });
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&remaining[8..16]);
                let size = usize::try_from(u64::from_be_bytes(large)).map_err(|_| {
                    SourceError::Malformed {
                        reason: "box size exceeds address space".to_string(),
                    }
                })?;
                (16, size)
            }
            size => (8, size as usize),
        };

        if size < header_len || size > remaining.len() {
            return Err(SourceError::Malformed {
                reason: format!(
                    "{} box at offset {} declares {size} bytes, {} available",
                    String::from_utf8_lossy(&kind),
                    self.base_offset + self.pos,
                    remaining.len()
                ),
            });
        }

        let atom = Atom {
            kind,
            body: &remaining[header_len..size],
            body_offset: self.base_offset + self.pos + header_len,
        };
        self.pos += size;
        Ok(atom)
    }
}

impl<'a> Iterator for AtomIter<'a> {
    type Item = Result<Atom<'a>, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let result = self.read_next();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Finds the first box of the given type among siblings.
///
/// # Errors
///
/// - `SourceError::Malformed` - A box header before the match is corrupt
pub fn find_atom<'a>(
    mut atoms: AtomIter<'a>,
    kind: &[u8; 4],
) -> Result<Option<Atom<'a>>, SourceError> {
    for atom in &mut atoms {
        let atom = atom?;
        if &atom.kind == kind {
            return Ok(Some(atom));
        }
    }
    Ok(None)
}

/// Bounds-checked big-endian reader over a box body.
#[derive(Debug, Clone)]
pub struct BoxReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> BoxReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SourceError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SourceError::Malformed {
                reason: format!("{} box truncated at byte {}", self.context, self.pos),
            }),
        }
    }

    pub fn skip(&mut self, len: usize) -> Result<(), SourceError> {
        self.take(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, SourceError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, SourceError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, SourceError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, SourceError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn fourcc(&mut self) -> Result<[u8; 4], SourceError> {
        let bytes = self.take(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Reads the version byte and 24-bit flags of a full box.
    pub fn full_box_header(&mut self) -> Result<(u8, u32), SourceError> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
    }

    /// Entry count followed by a guard against counts the body cannot hold.
    pub fn entry_count(&mut self, entry_size: usize) -> Result<usize, SourceError> {
        let count = self.u32()? as usize;
        let available = (self.data.len() - self.pos) / entry_size.max(1);
        if count > available {
            return Err(SourceError::Malformed {
                reason: format!(
                    "{} box lists {count} entries but holds at most {available}",
                    self.context
                ),
            });
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut data = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(kind);
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_find_atom() {
        let mut data = boxed(b"ftyp", &[0u8; 8]);
        data.extend(boxed(b"moov", &[1, 2, 3, 4]));

        let moov = find_atom(AtomIter::new(&data, 0), b"moov").unwrap().unwrap();
        assert_eq!(moov.body, &[1, 2, 3, 4]);
        assert_eq!(moov.body_offset, 24);
        assert!(find_atom(AtomIter::new(&data, 0), b"mdat").unwrap().is_none());
    }

    #[test]
    fn test_large_and_open_ended_sizes() {
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[9, 9, 9, 9]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[7, 7]);

        let atoms: Vec<_> = AtomIter::new(&data, 0).collect::<Result<_, _>>().unwrap();
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[0].body, &[9, 9, 9, 9]);
        assert_eq!(&atoms[1].kind, b"free");
        assert_eq!(atoms[1].body, &[7, 7]);
    }

    #[test]
    fn test_truncated_box_is_malformed() {
        let mut data = 64u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"moov");
        data.extend_from_slice(&[0; 8]);

        let mut atoms = AtomIter::new(&data, 0);
        assert!(matches!(atoms.next(), Some(Err(SourceError::Malformed { .. }))));
        assert!(atoms.next().is_none());
    }

    #[test]
    fn test_box_reader_bounds() {
        let body = [0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0xAB];
        let mut reader = BoxReader::new(&body, "test");
        assert_eq!(reader.full_box_header().unwrap(), (1, 2));
        assert_eq!(reader.u32().unwrap(), 5);
        assert_eq!(reader.u8().unwrap(), 0xAB);
        assert!(reader.u16().is_err());

        let mut counted = BoxReader::new(&[0, 0, 0, 9, 1, 2, 3, 4], "stts");
        assert!(counted.entry_count(8).is_err());
    }
}
