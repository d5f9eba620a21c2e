//! Tensor codecs: a fixed header followed by a raw little-endian body.
//!
//! TENSOR_F32 / TENSOR_F16 / TENSOR_QNT8 carry one dense tensor;
//! MIXED_LATENT carries varuint-delimited tensor segments; DLPACK wraps an
//! opaque capsule behind the same header (the receiver must copy or
//! consume the capsule before acknowledging the frame).
//!
//! The canonical envelope form for a dense tensor is kind `tensor` with
//! payload keys `data` (raw bytes), `shape` (list of ints), and for the
//! quantized codec `scale`. Orientation and quantization markers travel
//! in the header flag bits.

use bytes::Bytes;

use crate::constants::codec_id;
use crate::error::{Result, XcpError};
use crate::ether::{Ether, Value};

use super::binary::{get_varuint, put_varuint};
use super::EtherCodec;

/// Tensor header length on the wire.
pub const TENSOR_HEADER_LEN: usize = 40;

/// Header flag: INT8 body is quantized per row.
pub const TENSOR_FLAG_ROW_QUANTIZED: u8 = 0x01;
/// Header flag: body is column-major.
pub const TENSOR_FLAG_COL_MAJOR: u8 = 0x02;

/// Element type of a tensor body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TensorDtype {
    F32 = 0,
    F16 = 1,
    Int8 = 2,
}

impl TensorDtype {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::Int8),
            _ => None,
        }
    }

    /// Bytes per element.
    pub fn elem_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Int8 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Int8 => "int8",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f32" => Some(Self::F32),
            "f16" => Some(Self::F16),
            "int8" => Some(Self::Int8),
            _ => None,
        }
    }
}

/// Fixed prefix of every raw tensor body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorHeader {
    pub ndim: u8,
    pub dtype: TensorDtype,
    pub flags: u8,
    pub shape: [u32; 8],
    pub scale: f32,
}

impl TensorHeader {
    pub fn new(dims: &[u32], dtype: TensorDtype) -> Result<Self> {
        if dims.is_empty() || dims.len() > 8 {
            return Err(XcpError::EncodeFailed(format!(
                "tensor ndim {} outside 1..=8",
                dims.len()
            )));
        }
        let mut shape = [0u32; 8];
        shape[..dims.len()].copy_from_slice(dims);
        Ok(Self {
            ndim: dims.len() as u8,
            dtype,
            flags: 0,
            shape,
            scale: 1.0,
        })
    }

    /// Dims actually in use.
    pub fn dims(&self) -> &[u32] {
        &self.shape[..self.ndim as usize]
    }

    /// Total element count.
    pub fn element_count(&self) -> u64 {
        self.dims().iter().map(|&d| u64::from(d)).product()
    }

    /// Expected body length in bytes.
    pub fn body_len(&self) -> u64 {
        self.element_count() * self.dtype.elem_size() as u64
    }

    pub fn encode(&self) -> [u8; TENSOR_HEADER_LEN] {
        let mut buf = [0u8; TENSOR_HEADER_LEN];
        buf[0] = self.ndim;
        buf[1] = self.dtype as u8;
        buf[2] = self.flags;
        // buf[3] is padding
        for (i, dim) in self.shape.iter().enumerate() {
            buf[4 + i * 4..8 + i * 4].copy_from_slice(&dim.to_le_bytes());
        }
        buf[36..40].copy_from_slice(&self.scale.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TENSOR_HEADER_LEN {
            return Err(XcpError::DecodeFailed("tensor header truncated".into()));
        }
        let ndim = buf[0];
        if !(1..=8).contains(&ndim) {
            return Err(XcpError::DecodeFailed(format!("tensor ndim {ndim} outside 1..=8")));
        }
        let dtype = TensorDtype::from_u8(buf[1])
            .ok_or_else(|| XcpError::DecodeFailed(format!("unknown tensor dtype {}", buf[1])))?;
        let mut shape = [0u32; 8];
        for (i, dim) in shape.iter_mut().enumerate() {
            *dim = u32::from_le_bytes(buf[4 + i * 4..8 + i * 4].try_into().expect("len checked"));
        }
        // Unused dims must stay zero.
        if shape[ndim as usize..].iter().any(|&d| d != 0) {
            return Err(XcpError::DecodeFailed("nonzero unused tensor dims".into()));
        }
        Ok(Self {
            ndim,
            dtype,
            flags: buf[2],
            shape,
            scale: f32::from_le_bytes(buf[36..40].try_into().expect("len checked")),
        })
    }
}

// ---------------------------------------------------------------------------
// f16 conversion (bit-level, round-to-nearest-even)
// ---------------------------------------------------------------------------

/// Convert an f32 to IEEE 754 binary16 bits.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Inf / NaN; keep a mantissa bit for NaN.
        let nan_bit = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | nan_bit;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00; // overflow to infinity
    }
    if unbiased >= -14 {
        // Normal range; round to nearest even on the dropped 13 bits.
        let mant = mantissa >> 13;
        let rest = mantissa & 0x1FFF;
        let mut half = sign | (((unbiased + 15) as u16) << 10) | mant as u16;
        if rest > 0x1000 || (rest == 0x1000 && mant & 1 == 1) {
            half += 1;
        }
        return half;
    }
    if unbiased >= -24 {
        // Subnormal: drop 13 mantissa bits plus one per exponent step
        // below the normal range.
        let drop = (-unbiased - 1) as u32;
        let implicit = mantissa | 0x0080_0000;
        let mant = implicit >> drop;
        let rest = implicit & ((1 << drop) - 1);
        let mut half = sign | mant as u16;
        let midpoint = 1u32 << (drop - 1);
        if rest > midpoint || (rest == midpoint && mant & 1 == 1) {
            half += 1;
        }
        return half;
    }
    sign // underflow to zero
}

/// Convert IEEE 754 binary16 bits to an f32.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits & 0x8000) << 16;
    let exp = (bits >> 10) & 0x1F;
    let mantissa = u32::from(bits & 0x03FF);

    let out = if exp == 0x1F {
        sign | 0x7F80_0000 | (mantissa << 13)
    } else if exp != 0 {
        sign | ((u32::from(exp) + 112) << 23) | (mantissa << 13)
    } else if mantissa != 0 {
        // Subnormal: normalize.
        let shift = mantissa.leading_zeros() - 21;
        let mant = (mantissa << (shift + 1)) & 0x03FF;
        sign | ((113 - shift) << 23) | (mant << 13)
    } else {
        sign
    };
    f32::from_bits(out)
}

// ---------------------------------------------------------------------------
// envelope helpers
// ---------------------------------------------------------------------------

/// Build the canonical tensor envelope from raw parts.
pub fn tensor_ether(dims: &[u32], dtype: TensorDtype, data: Bytes) -> Ether {
    let mut e = Ether::new("tensor", 1);
    e.payload.insert("data".into(), Value::Bytes(data));
    e.payload.insert(
        "shape".into(),
        Value::List(dims.iter().map(|&d| Value::from(d)).collect()),
    );
    if dtype == TensorDtype::Int8 {
        e.payload.insert("scale".into(), Value::Float(1.0));
    }
    e
}

/// Build an f32 tensor envelope from a float slice.
pub fn tensor_from_f32(dims: &[u32], values: &[f32]) -> Ether {
    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    tensor_ether(dims, TensorDtype::F32, Bytes::from(data))
}

/// Build an f16 tensor envelope, converting from f32 values.
pub fn tensor_from_f32_as_f16(dims: &[u32], values: &[f32]) -> Ether {
    let mut data = Vec::with_capacity(values.len() * 2);
    for v in values {
        data.extend_from_slice(&f32_to_f16_bits(*v).to_le_bytes());
    }
    tensor_ether(dims, TensorDtype::F16, Bytes::from(data))
}

fn ether_tensor_parts(ether: &Ether, dtype: TensorDtype) -> Result<(TensorHeader, Bytes)> {
    let data = ether
        .payload
        .get("data")
        .and_then(Value::as_bytes)
        .ok_or_else(|| XcpError::EncodeFailed("tensor payload missing data bytes".into()))?;
    let shape = ether
        .payload
        .get("shape")
        .and_then(Value::as_list)
        .ok_or_else(|| XcpError::EncodeFailed("tensor payload missing shape".into()))?;
    let mut dims = Vec::with_capacity(shape.len());
    for d in shape {
        let d = d
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| XcpError::EncodeFailed("bad tensor dim".into()))?;
        dims.push(d);
    }
    let mut header = TensorHeader::new(&dims, dtype)?;
    if let Some(scale) = ether.payload.get("scale").and_then(Value::as_f64) {
        header.scale = scale as f32;
    }
    if ether
        .payload
        .get("row_quantized")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        header.flags |= TENSOR_FLAG_ROW_QUANTIZED;
    }
    if ether
        .payload
        .get("col_major")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        header.flags |= TENSOR_FLAG_COL_MAJOR;
    }
    if header.body_len() != data.len() as u64 {
        return Err(XcpError::EncodeFailed(format!(
            "tensor body is {} bytes, shape implies {}",
            data.len(),
            header.body_len()
        )));
    }
    Ok((header, data.clone()))
}

fn tensor_body_to_ether(header: &TensorHeader, body: Bytes) -> Ether {
    let mut e = tensor_ether(header.dims(), header.dtype, body);
    if header.dtype == TensorDtype::Int8 {
        e.payload
            .insert("scale".into(), Value::Float(f64::from(header.scale)));
    }
    if header.flags & TENSOR_FLAG_ROW_QUANTIZED != 0 {
        e.payload.insert("row_quantized".into(), Value::Bool(true));
    }
    if header.flags & TENSOR_FLAG_COL_MAJOR != 0 {
        e.payload.insert("col_major".into(), Value::Bool(true));
    }
    e
}

fn has_tensor_shape(ether: &Ether) -> bool {
    ether.payload.get("data").map(|v| v.as_bytes().is_some()) == Some(true)
        && ether.payload.get("shape").map(|v| v.as_list().is_some()) == Some(true)
}

// ---------------------------------------------------------------------------
// dense tensor codec
// ---------------------------------------------------------------------------

/// One codec per dtype; the id fixes the element type.
pub struct TensorCodec {
    dtype: TensorDtype,
}

impl TensorCodec {
    pub fn f32() -> Self {
        Self {
            dtype: TensorDtype::F32,
        }
    }

    pub fn f16() -> Self {
        Self {
            dtype: TensorDtype::F16,
        }
    }

    pub fn qnt8() -> Self {
        Self {
            dtype: TensorDtype::Int8,
        }
    }
}

impl EtherCodec for TensorCodec {
    fn id(&self) -> u16 {
        match self.dtype {
            TensorDtype::F32 => codec_id::TENSOR_F32,
            TensorDtype::F16 => codec_id::TENSOR_F16,
            TensorDtype::Int8 => codec_id::TENSOR_QNT8,
        }
    }

    fn name(&self) -> &'static str {
        match self.dtype {
            TensorDtype::F32 => "tensor_f32",
            TensorDtype::F16 => "tensor_f16",
            TensorDtype::Int8 => "tensor_qnt8",
        }
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn can_encode(&self, ether: &Ether) -> bool {
        has_tensor_shape(ether)
    }

    fn carries_kind(&self) -> bool {
        false
    }

    fn encode(&self, ether: &Ether) -> Result<Vec<u8>> {
        let (header, body) = ether_tensor_parts(ether, self.dtype)?;
        let mut buf = Vec::with_capacity(TENSOR_HEADER_LEN + body.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let header = TensorHeader::decode(bytes)?;
        if header.dtype != self.dtype {
            return Err(XcpError::DecodeFailed(format!(
                "body dtype {} does not match codec {}",
                header.dtype.name(),
                self.name()
            )));
        }
        let body = &bytes[TENSOR_HEADER_LEN..];
        if body.len() as u64 != header.body_len() {
            return Err(XcpError::DecodeFailed(format!(
                "tensor body is {} bytes, header implies {}",
                body.len(),
                header.body_len()
            )));
        }
        Ok(tensor_body_to_ether(&header, Bytes::copy_from_slice(body)))
    }
}

// ---------------------------------------------------------------------------
// mixed latent codec
// ---------------------------------------------------------------------------

/// MIXED_LATENT (0x0010): varuint segment count, then per segment
/// `<subtype u8, varuint len, bytes>`.
pub struct MixedLatentCodec;

impl EtherCodec for MixedLatentCodec {
    fn id(&self) -> u16 {
        codec_id::MIXED_LATENT
    }

    fn name(&self) -> &'static str {
        "mixed_latent"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn can_encode(&self, ether: &Ether) -> bool {
        ether
            .payload
            .get("segments")
            .map(|v| v.as_list().is_some())
            == Some(true)
    }

    fn carries_kind(&self) -> bool {
        false
    }

    fn encode(&self, ether: &Ether) -> Result<Vec<u8>> {
        let segments = ether
            .payload
            .get("segments")
            .and_then(Value::as_list)
            .ok_or_else(|| XcpError::EncodeFailed("mixed latent payload missing segments".into()))?;
        let mut buf = Vec::new();
        put_varuint(&mut buf, segments.len() as u64);
        for segment in segments {
            let map = segment
                .as_map()
                .ok_or_else(|| XcpError::EncodeFailed("segment is not a map".into()))?;
            let subtype = map
                .get("subtype")
                .and_then(Value::as_i64)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| XcpError::EncodeFailed("segment missing subtype".into()))?;
            let data = map
                .get("data")
                .and_then(Value::as_bytes)
                .ok_or_else(|| XcpError::EncodeFailed("segment missing data".into()))?;
            buf.push(subtype);
            put_varuint(&mut buf, data.len() as u64);
            buf.extend_from_slice(data);
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let mut at = 0;
        let count = get_varuint(bytes, &mut at)? as usize;
        let mut segments = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let subtype = *bytes
                .get(at)
                .ok_or_else(|| XcpError::DecodeFailed("segment subtype truncated".into()))?;
            at += 1;
            let len = get_varuint(bytes, &mut at)? as usize;
            let end = at
                .checked_add(len)
                .filter(|&e| e <= bytes.len())
                .ok_or_else(|| XcpError::DecodeFailed("segment body truncated".into()))?;
            let mut map = std::collections::BTreeMap::new();
            map.insert("subtype".to_string(), Value::Int(i64::from(subtype)));
            map.insert(
                "data".to_string(),
                Value::Bytes(Bytes::copy_from_slice(&bytes[at..end])),
            );
            segments.push(Value::Map(map));
            at = end;
        }
        if at != bytes.len() {
            return Err(XcpError::DecodeFailed(format!(
                "{} trailing bytes",
                bytes.len() - at
            )));
        }
        let mut e = Ether::new("mixed_latent", 1);
        e.payload.insert("segments".into(), Value::List(segments));
        Ok(e)
    }
}

// ---------------------------------------------------------------------------
// dlpack codec
// ---------------------------------------------------------------------------

/// DLPACK (0x0021): tensor header + opaque capsule bytes.
///
/// The capsule's length is not derivable from the shape; the header
/// describes the logical tensor while the capsule carries whatever the
/// producing runtime exported.
pub struct DlpackCodec;

impl EtherCodec for DlpackCodec {
    fn id(&self) -> u16 {
        codec_id::DLPACK
    }

    fn name(&self) -> &'static str {
        "dlpack"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn can_encode(&self, ether: &Ether) -> bool {
        ether.payload.get("capsule").map(|v| v.as_bytes().is_some()) == Some(true)
            && ether.payload.get("shape").map(|v| v.as_list().is_some()) == Some(true)
    }

    fn carries_kind(&self) -> bool {
        false
    }

    fn encode(&self, ether: &Ether) -> Result<Vec<u8>> {
        let capsule = ether
            .payload
            .get("capsule")
            .and_then(Value::as_bytes)
            .ok_or_else(|| XcpError::EncodeFailed("dlpack payload missing capsule".into()))?;
        let shape = ether
            .payload
            .get("shape")
            .and_then(Value::as_list)
            .ok_or_else(|| XcpError::EncodeFailed("dlpack payload missing shape".into()))?;
        let dtype = ether
            .payload
            .get("dtype")
            .and_then(Value::as_str)
            .and_then(TensorDtype::from_name)
            .unwrap_or(TensorDtype::F32);
        let mut dims = Vec::with_capacity(shape.len());
        for d in shape {
            dims.push(
                d.as_i64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| XcpError::EncodeFailed("bad dlpack dim".into()))?,
            );
        }
        let header = TensorHeader::new(&dims, dtype)?;
        let mut buf = Vec::with_capacity(TENSOR_HEADER_LEN + capsule.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(capsule);
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let header = TensorHeader::decode(bytes)?;
        let mut e = Ether::new("dlpack", 1);
        e.payload.insert(
            "capsule".into(),
            Value::Bytes(Bytes::copy_from_slice(&bytes[TENSOR_HEADER_LEN..])),
        );
        e.payload.insert(
            "shape".into(),
            Value::List(header.dims().iter().map(|&d| Value::from(d)).collect()),
        );
        e.payload
            .insert("dtype".into(), Value::Str(header.dtype.name().into()));
        Ok(e)
    }
}
