//! A growable byte sink with typed forward-reference handles.
//!
//! An instruction encoder that emits a branch before its target exists
//! needs a way to come back and fill in the displacement once the target
//! is known. Rather than passing raw byte offsets around, allocating a
//! `ForwardRef` emits the placeholder bytes up front and resolving it
//! later writes the real displacement in place.
//!
//! Both the text buffer and the rodata buffer (and the runtime-helper
//! generators in `flap-runtime-gen`) are `ByteBuffer`s.

/// A position in a `ByteBuffer` where a 32-bit value was written as a
/// placeholder and still needs to be patched once the real value is
/// known (a relocation target, a forward jump, a call-site PLT offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardRef {
    pub position: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        ByteBuffer { bytes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn push_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn push_bytes(&mut self, bs: &[u8]) {
        self.bytes.extend_from_slice(bs);
    }

    pub fn push_u16_le(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u32_le(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_i32_le(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u64_le(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_i64_le(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_f64_le(&mut self, v: f64) {
        self.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    /// Pad with zero bytes until `self.len()` is a multiple of `align`.
    pub fn align_to(&mut self, align: usize) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }

    /// Emit four zeroed placeholder bytes and return a handle that can
    /// later be resolved with `patch_i32` or `patch_rel32`.
    pub fn placeholder_i32(&mut self) -> ForwardRef {
        let position = self.bytes.len();
        self.push_i32_le(0);
        ForwardRef { position }
    }

    /// Overwrite the 4 bytes at `fref` with `value`, little-endian.
    pub fn patch_i32(&mut self, fref: ForwardRef, value: i32) {
        let bytes = value.to_le_bytes();
        self.bytes[fref.position..fref.position + 4].copy_from_slice(&bytes);
    }

    /// Overwrite the 4 bytes at `fref` with the 32-bit relative
    /// displacement from the end of that field (the next instruction's
    /// first byte, per x86-64 rel32 semantics) to `target`.
    pub fn patch_rel32(&mut self, fref: ForwardRef, target: usize) {
        let next_instr = fref.position as i64 + 4;
        let disp = target as i64 - next_instr;
        self.patch_i32(fref, disp as i32);
    }

    /// Overwrite an arbitrary byte range, used when a whole instruction
    /// (not just one operand) must be re-emitted in place.
    pub fn patch_bytes(&mut self, position: usize, bytes: &[u8]) {
        self.bytes[position..position + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_then_patch_rel32_roundtrips() {
        let mut buf = ByteBuffer::new();
        buf.push_u8(0xe9); // jmp rel32
        let fref = buf.placeholder_i32();
        buf.push_u8(0x90); // nop, marks "here"
        let target = buf.len();
        buf.patch_rel32(fref, target);
        let bytes = buf.into_vec();
        let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(disp, 1); // one nop between the end of the field and target
    }

    #[test]
    fn align_to_pads_with_zeros() {
        let mut buf = ByteBuffer::new();
        buf.push_u8(1);
        buf.push_u8(2);
        buf.push_u8(3);
        buf.align_to(8);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }
}
