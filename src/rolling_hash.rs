/// Adler-32 style checksum over a window that slides across a byte slice.
///
/// Two 16-bit sums (a, b) combined into 32 bits; advancing the window by one
/// byte is O(1).
const MOD_ADLER: u32 = 65521;

pub struct RollingWindow<'a> {
    data: &'a [u8],
    start: usize,
    len: usize,
    a: u32,
    b: u32,
}

impl<'a> RollingWindow<'a> {
    /// Window over `data[start..start + len]`. Panics if that range is out of bounds.
    pub fn new(data: &'a [u8], start: usize, len: usize) -> Self {
        let (a, b) = sums(&data[start..start + len]);
        Self {
            data,
            start,
            len,
            a,
            b,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn bytes(&self) -> &'a [u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Move the window forward by one byte. Returns false at the end of the data.
    pub fn slide(&mut self) -> bool {
        let end = self.start + self.len;
        if end >= self.data.len() {
            return false;
        }
        let out = self.data[self.start] as u32;
        let incoming = self.data[end] as u32;

        self.a = (self.a + MOD_ADLER - out + incoming) % MOD_ADLER;
        let shed = ((out as u64 * self.len as u64) % MOD_ADLER as u64) as u32;
        self.b = (self.b + self.a + (MOD_ADLER - 1) + (MOD_ADLER - shed)) % MOD_ADLER;
        self.start += 1;
        true
    }

    /// Recompute from scratch at a new offset.
    pub fn jump(&mut self, start: usize) {
        let (a, b) = sums(&self.data[start..start + self.len]);
        self.start = start;
        self.a = a;
        self.b = b;
    }
}

/// Digest of a standalone block, equal to a window's digest over the same bytes.
pub fn block_digest(block: &[u8]) -> u32 {
    let (a, b) = sums(block);
    (b << 16) | a
}

fn sums(block: &[u8]) -> (u32, u32) {
    // Accumulate wide and reduce once.
    let mut a: u64 = 1;
    let mut b: u64 = 0;
    for &byte in block {
        a += byte as u64;
        b += a;
    }
    ((a % MOD_ADLER as u64) as u32, (b % MOD_ADLER as u64) as u32)
}
