use glam::{Quat, Vec3};

/// Failure while decoding wire data. Every read is bounds-checked; a
/// truncated or malformed buffer surfaces here instead of panicking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer: wanted {wanted} more bytes, {remaining} remaining")]
    UnexpectedEof { wanted: usize, remaining: usize },
    #[error("invalid message kind: {0}")]
    InvalidMessageKind(u8),
    #[error("invalid packet kind: {0}")]
    InvalidPacketKind(u8),
    #[error("bad protocol magic")]
    BadMagic,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

fn max_exponent(expbits: u32) -> u64 {
    (1u64 << expbits) - 1
}

/// Pack a float into an explicit sign/exponent/mantissa layout parameterized
/// by `(bits, expbits)`. The wire format is defined by this algorithm, not by
/// the host's native float representation, so the same bytes decode to the
/// same value on any implementation of the protocol.
///
/// Zero (positive or negative) packs to 0. Infinities pack to the
/// max-exponent/zero-mantissa pattern and NaN to max-exponent with a non-zero
/// mantissa, mirroring IEEE-754 so `unpack754` restores them.
pub fn pack754(f: f64, bits: u32, expbits: u32) -> u64 {
    let significandbits = bits - expbits - 1;
    if f == 0.0 {
        return 0;
    }
    if f.is_nan() {
        return (max_exponent(expbits) << significandbits) | (1u64 << (significandbits - 1));
    }
    if f.is_infinite() {
        let sign = if f.is_sign_negative() { 1u64 } else { 0 };
        return (sign << (bits - 1)) | (max_exponent(expbits) << significandbits);
    }
    // check sign and begin normalization
    let (sign, mut fnorm) = if f < 0.0 { (1u64, -f) } else { (0u64, f) };
    // get the normalized form of f and track the exponent
    let mut shift: i64 = 0;
    while fnorm >= 2.0 {
        fnorm /= 2.0;
        shift += 1;
    }
    while fnorm < 1.0 {
        fnorm *= 2.0;
        shift -= 1;
    }
    fnorm -= 1.0;
    // calculate the binary form of the significand
    let significand = (fnorm * ((1u64 << significandbits) as f64 + 0.5)) as u64;
    // bias the exponent
    let expo = (shift + ((1i64 << (expbits - 1)) - 1)) as u64;
    (sign << (bits - 1)) | (expo << significandbits) | significand
}

/// Inverse of [`pack754`].
pub fn unpack754(i: u64, bits: u32, expbits: u32) -> f64 {
    let significandbits = bits - expbits - 1;
    if i == 0 {
        return 0.0;
    }
    let expo = (i >> significandbits) & ((1u64 << expbits) - 1);
    let mantissa = i & ((1u64 << significandbits) - 1);
    let negative = (i >> (bits - 1)) & 1 == 1;
    if expo == max_exponent(expbits) {
        if mantissa != 0 {
            return f64::NAN;
        }
        return if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    // pull the significand and add the implicit leading one back on
    let mut result = mantissa as f64 / (1u64 << significandbits) as f64 + 1.0;
    // undo the exponent bias
    let bias = ((1u64 << (expbits - 1)) - 1) as i64;
    let mut shift = expo as i64 - bias;
    while shift > 0 {
        result *= 2.0;
        shift -= 1;
    }
    while shift < 0 {
        result /= 2.0;
        shift += 1;
    }
    if negative { -result } else { result }
}

pub fn pack754_32(f: f32) -> u32 {
    pack754(f as f64, 32, 8) as u32
}

pub fn unpack754_32(i: u32) -> f32 {
    unpack754(i as u64, 32, 8) as f32
}

pub fn pack754_64(f: f64) -> u64 {
    pack754(f, 64, 11)
}

pub fn unpack754_64(i: u64) -> f64 {
    unpack754(i, 64, 11)
}

/// Cursor-based byte buffer with independent read (`gpos`) and write (`ppos`)
/// positions. All scalars are big-endian; floats go through the explicit
/// [`pack754`] layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteStream {
    buf: Vec<u8>,
    gpos: usize,
    ppos: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            gpos: 0,
            ppos: 0,
        }
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self {
            buf,
            gpos: 0,
            ppos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once the read cursor has consumed every byte.
    pub fn eof(&self) -> bool {
        self.gpos >= self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.gpos)
    }

    pub fn seek_read(&mut self, pos: usize) {
        self.gpos = pos;
    }

    pub fn seek_write(&mut self, pos: usize) {
        self.ppos = pos;
    }

    pub fn read_pos(&self) -> usize {
        self.gpos
    }

    pub fn write_pos(&self) -> usize {
        self.ppos
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.ppos + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.ppos..end].copy_from_slice(bytes);
        self.ppos = end;
    }

    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        if self.gpos + n > self.buf.len() {
            return Err(DecodeError::UnexpectedEof {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.gpos..self.gpos + n];
        self.gpos += n;
        Ok(slice)
    }

    pub fn write_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.put(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.put(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.put(&v.to_be_bytes());
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_u16(v as u16);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_u32(pack754_32(v));
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(pack754_64(v));
    }

    pub fn write_vec3(&mut self, v: Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    pub fn write_quat(&mut self, q: Quat) {
        self.write_f32(q.x);
        self.write_f32(q.y);
        self.write_f32(q.z);
        self.write_f32(q.w);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(unpack754_32(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(unpack754_64(self.read_u64()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, DecodeError> {
        Ok(Vec3::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    pub fn read_quat(&mut self) -> Result<Quat, DecodeError> {
        let x = self.read_f32()?;
        let y = self.read_f32()?;
        let z = self.read_f32()?;
        let w = self.read_f32()?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Consumes and returns everything after the read cursor.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.buf[self.gpos..].to_vec();
        self.gpos = self.buf.len();
        rest
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(buf: Vec<u8>) -> Self {
        Self::from_bytes(buf)
    }
}

impl From<&[u8]> for ByteStream {
    fn from(buf: &[u8]) -> Self {
        Self::from_bytes(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut stream = ByteStream::new();
        stream.write_u8(0xAB);
        stream.write_u16(0xBEEF);
        stream.write_u32(0xDEADBEEF);
        stream.write_u64(0x0123456789ABCDEF);
        stream.write_i16(-1234);
        stream.write_i32(-1);
        stream.write_i64(i64::MIN);

        assert_eq!(stream.read_u8().unwrap(), 0xAB);
        assert_eq!(stream.read_u16().unwrap(), 0xBEEF);
        assert_eq!(stream.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(stream.read_u64().unwrap(), 0x0123456789ABCDEF);
        assert_eq!(stream.read_i16().unwrap(), -1234);
        assert_eq!(stream.read_i32().unwrap(), -1);
        assert_eq!(stream.read_i64().unwrap(), i64::MIN);
        assert!(stream.eof());
    }

    #[test]
    fn scalars_are_big_endian() {
        let mut stream = ByteStream::new();
        stream.write_u32(0x01020304);
        assert_eq!(stream.as_slice(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn read_past_end_is_an_error() {
        let mut stream = ByteStream::from_bytes(vec![1, 2, 3]);
        assert_eq!(
            stream.read_u32(),
            Err(DecodeError::UnexpectedEof {
                wanted: 4,
                remaining: 3
            })
        );
        // a failed read does not advance the cursor
        assert_eq!(stream.read_u16().unwrap(), 0x0102);
        assert_eq!(stream.remaining(), 1);
    }

    #[test]
    fn float_roundtrip_within_epsilon() {
        for &v in &[0.0f32, 1.0, -1.0, 0.015625, 12345.678, -98765.4, 1.0e30] {
            let packed = pack754_32(v);
            let unpacked = unpack754_32(packed);
            assert!(
                (unpacked - v).abs() <= v.abs() * 1.0e-6,
                "{} -> {}",
                v,
                unpacked
            );
        }
        for &v in &[0.0f64, -2.5, 1.0e-12, 6.02214076e23] {
            let unpacked = unpack754_64(pack754_64(v));
            assert!((unpacked - v).abs() <= v.abs() * 1.0e-12);
        }
    }

    #[test]
    fn negative_zero_packs_to_zero() {
        assert_eq!(pack754_32(-0.0), 0);
        assert_eq!(unpack754_32(pack754_32(-0.0)), 0.0);
    }

    #[test]
    fn non_finite_values_survive_packing() {
        assert_eq!(unpack754_32(pack754_32(f32::INFINITY)), f32::INFINITY);
        assert_eq!(
            unpack754_32(pack754_32(f32::NEG_INFINITY)),
            f32::NEG_INFINITY
        );
        assert!(unpack754_32(pack754_32(f32::NAN)).is_nan());
        assert_eq!(unpack754_64(pack754_64(f64::INFINITY)), f64::INFINITY);
        assert!(unpack754_64(pack754_64(f64::NAN)).is_nan());
    }

    #[test]
    fn vec3_and_quat_roundtrip() {
        let v = Vec3::new(1.5, -2.25, 1024.0);
        let q = Quat::from_rotation_y(std::f32::consts::FRAC_PI_3);

        let mut stream = ByteStream::new();
        stream.write_vec3(v);
        stream.write_quat(q);

        let rv = stream.read_vec3().unwrap();
        let rq = stream.read_quat().unwrap();
        assert!((rv - v).length() < 1.0e-4);
        assert!((rq.x - q.x).abs() < 1.0e-6);
        assert!((rq.w - q.w).abs() < 1.0e-6);
        assert!(stream.eof());
    }

    #[test]
    fn independent_cursors() {
        let mut stream = ByteStream::new();
        stream.write_u16(7);
        assert_eq!(stream.read_u16().unwrap(), 7);
        stream.write_u16(9);
        assert_eq!(stream.read_u16().unwrap(), 9);
        assert_eq!(stream.write_pos(), 4);
        assert_eq!(stream.read_pos(), 4);
    }
}
