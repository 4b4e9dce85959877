//! Bounds-checked views over live image memory.
//!
//! Every structure this crate reads (headers, load commands, symbol tables,
//! string tables, export tries) is reached through a [`Bytes`] view of known
//! length. Field reads past the end of a view return `None` instead of
//! touching memory outside it.

/// A byte view with explicit field decoding in native byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bytes<'data>(pub &'data [u8]);

impl<'data> Bytes<'data> {
    /// Creates a view of `len` bytes starting at `addr`.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be readable memory that stays mapped and
    /// unmodified for `'data`.
    pub unsafe fn from_raw(addr: usize, len: usize) -> Bytes<'data> {
        if len == 0 || addr == 0 {
            return Bytes(&[]);
        }
        Bytes(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Address of the first byte of the view.
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn get(&self, offset: usize, len: usize) -> Option<&'data [u8]> {
        self.0.get(offset..offset.checked_add(len)?)
    }

    pub fn sub(&self, offset: usize, len: usize) -> Option<Bytes<'data>> {
        self.get(offset, len).map(Bytes)
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.0.get(offset).copied()
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.get(offset, 4)?.try_into().ok().map(u32::from_ne_bytes)
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        self.get(offset, 8)?.try_into().ok().map(u64::from_ne_bytes)
    }

    /// Reads a NUL-terminated string starting at `offset`.
    ///
    /// The terminator must lie inside the view; the returned slice excludes it.
    pub fn read_cstr(&self, offset: usize) -> Option<&'data [u8]> {
        let tail = self.0.get(offset..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..len])
    }

    /// Reads a ULEB128 value at `offset`, see [`read_uleb128`].
    pub fn read_uleb128(&self, offset: usize) -> Option<(u64, usize)> {
        read_uleb128(self.0, offset).ok()
    }
}

/// Read a ULEB128 encoded unsigned integer, returns (value, bytes_consumed)
pub fn read_uleb128(data: &[u8], start_index: usize) -> Result<(u64, usize), &'static str> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_consumed = 0;

    while start_index
        .checked_add(bytes_consumed)
        .is_some_and(|i| i < data.len())
    {
        let byte = data[start_index + bytes_consumed];
        bytes_consumed += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_consumed));
        }

        shift += 7;
        if shift >= 64 {
            return Err("ULEB128 value too large");
        }
    }

    Err("Unexpected end of data while reading ULEB128")
}
