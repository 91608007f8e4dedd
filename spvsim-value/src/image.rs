//! Image and sampler values.
//!
//! Texels live behind a shared handle: loading an image from a variable
//! hands out another reference to the same storage rather than a copy,
//! matching how image writes must be visible through every binding of the
//! image.
use anyhow::bail;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{anyhow, Result};
use crate::ty::{TypeArena, TypeHandle};
use crate::value::{Primitive, Value};

/// How the channels of a texel are stored: each digit 1-4 gives the storage
/// slot (1-based) of R, G, B, A respectively, 0 disables the channel. For
/// example `2341` stores in A, R, G, B order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Component {
    channels: [u32; 4],
    count: u32,
}

impl Component {
    pub fn decode(encoded: u32, check: bool) -> Result<Component> {
        if check {
            if encoded == 0 {
                bail!("image components must have at least one channel active");
            }
            if encoded > 4321 {
                bail!("image components exceed the maximum legal value (4321)");
            }
        }
        let mut channels = [0u32; 4];
        let mut count = 0;
        let mut scale = 1000;
        let mut rem = encoded;
        for slot in channels.iter_mut() {
            let digit = rem / scale;
            if digit > 0 {
                if check && digit > 4 {
                    bail!("image component digit exceeds the maximum value (4)");
                }
                rem -= digit * scale;
                count += 1;
            }
            *slot = digit;
            scale /= 10;
        }
        if check {
            let mut seen = [false; 4];
            for &digit in &channels {
                if digit == 0 {
                    continue;
                }
                if digit > count {
                    bail!("image component digit exceeds the active channel count");
                }
                if seen[(digit - 1) as usize] {
                    bail!("image component digit is repeated");
                }
                seen[(digit - 1) as usize] = true;
            }
        }
        Ok(Component { channels, count })
    }

    pub fn encode(&self) -> u32 {
        self.channels[0] * 1000 + self.channels[1] * 100 + self.channels[2] * 10 + self.channels[3]
    }

    pub fn count(&self) -> u32 {
        self.count
    }
    /// Storage slot of channel `i` (0 = R .. 3 = A), or None if inactive.
    pub fn slot(&self, i: usize) -> Option<u32> {
        match self.channels[i] {
            0 => None,
            d => Some(d - 1),
        }
    }

    /// Active channels must agree for a copy, though their order may vary.
    pub fn check_compatible(&self, other: &Component) -> Result<()> {
        for i in 0..4 {
            if (self.channels[i] == 0) != (other.channels[i] == 0) {
                bail!(
                    "type mismatch: images activate different channels ({} vs {})",
                    self.encode(),
                    other.encode()
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ImageInner {
    /// Path to an external image file, carried but never dereferenced.
    reference: Option<String>,
    comps: Component,
    xx: u32,
    yy: u32,
    zz: u32,
    /// Flat texel buffer, `comps.count` words per texel.
    data: Vec<u32>,
}

impl ImageInner {
    fn texel_count(&self) -> usize {
        let mut total = self.xx as usize;
        if self.yy > 0 {
            total *= self.yy as usize;
        }
        if self.zz > 0 {
            total *= self.zz as usize;
        }
        total
    }

    fn base_index(&self, x: u32, y: u32, z: u32) -> Result<usize> {
        if (x > 0 && x >= self.xx) || (y > 0 && y >= self.yy.max(1)) || (z > 0 && z >= self.zz.max(1))
        {
            bail!(
                "image access ({}, {}, {}) out of bounds ({} x {} x {})",
                x,
                y,
                z,
                self.xx,
                self.yy,
                self.zz
            );
        }
        let row = self.xx as usize * self.comps.count as usize;
        let plane = self.yy.max(1) as usize * row;
        Ok(x as usize * self.comps.count as usize + y as usize * row + z as usize * plane)
    }
}

/// An image value: dimensions, component order, shared texels.
#[derive(Clone, Debug)]
pub struct Image {
    ty: TypeHandle,
    inner: Rc<RefCell<ImageInner>>,
}

impl Image {
    pub fn empty(arena: &TypeArena, ty: TypeHandle) -> Result<Image> {
        let comps = Component::decode(arena.get(ty).comps(), false)?;
        Ok(Image {
            ty,
            inner: Rc::new(RefCell::new(ImageInner {
                reference: None,
                comps,
                xx: 0,
                yy: 0,
                zz: 0,
                data: Vec::new(),
            })),
        })
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    /// Relabel without touching the shared texels.
    pub fn cast(&mut self, ty: TypeHandle) {
        self.ty = ty;
    }

    pub fn dims(&self) -> (u32, u32, u32) {
        let inner = self.inner.borrow();
        (inner.xx, inner.yy, inner.zz)
    }

    pub fn active_components(&self) -> u32 {
        self.inner.borrow().comps.count
    }

    pub fn describe(&self) -> String {
        let inner = self.inner.borrow();
        format!(
            "{}x{}x{}:{}",
            inner.xx,
            inner.yy,
            inner.zz,
            inner.comps.encode()
        )
    }

    /// Whether the two images share texel storage.
    pub fn shares_storage(&self, other: &Image) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read one texel's active channels, in R, G, B, A order. The slots
    /// come back typed as the image's texel type.
    pub fn read(&self, arena: &TypeArena, x: u32, y: u32, z: u32) -> Result<Vec<Value>> {
        let texel_ty = arena.get(self.ty).element().unwrap_or_else(|_| arena.f32());
        let inner = self.inner.borrow();
        let base = inner.base_index(x, y, z)?;
        let mut out = Vec::with_capacity(inner.comps.count as usize);
        for i in 0..4 {
            if let Some(slot) = inner.comps.slot(i) {
                let word = *inner
                    .data
                    .get(base + slot as usize)
                    .ok_or_else(|| anyhow!("image texel buffer is undersized"))?;
                let mut prim = Primitive::zeroed(texel_ty);
                prim.set_bits(word);
                out.push(Value::Primitive(prim));
            }
        }
        Ok(out)
    }

    /// Write one texel from a channel-ordered value list.
    pub fn write(&self, x: u32, y: u32, z: u32, texel: &[Value]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let base = inner.base_index(x, y, z)?;
        let mut written = 0;
        for i in 0..4 {
            if let Some(slot) = inner.comps.slot(i) {
                let val = texel
                    .get(written)
                    .ok_or_else(|| anyhow!("image write texel has too few components"))?;
                let bits = val.as_primitive()?.bits();
                let at = base + slot as usize;
                if at >= inner.data.len() {
                    bail!("image texel buffer is undersized");
                }
                inner.data[at] = bits;
                written += 1;
            }
        }
        Ok(())
    }

    pub fn equals(&self, other: &Image) -> bool {
        if self.shares_storage(other) {
            return true;
        }
        let a = self.inner.borrow();
        let b = other.inner.borrow();
        a.xx == b.xx
            && a.yy == b.yy
            && a.zz == b.zz
            && a.comps == b.comps
            && a.data == b.data
    }

    /// Copy from another image (rewriting channel slots) or from the
    /// external struct form `{ ref, dim, comps, data }`.
    pub fn copy_from(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        match other {
            Value::Image(src) => self.copy_from_image(src),
            Value::Struct(_) => self.copy_from_struct(other, arena),
            _ => bail!("type mismatch: cannot copy image from a non-image value"),
        }
    }

    fn copy_from_image(&mut self, src: &Image) -> Result<()> {
        if self.shares_storage(src) {
            return Ok(());
        }
        let from = src.inner.borrow();
        let mut into = self.inner.borrow_mut();
        if into.xx != 0 && (into.xx, into.yy, into.zz) != (from.xx, from.yy, from.zz) {
            bail!("type mismatch: cannot copy between images of different extents");
        }
        into.comps.check_compatible(&from.comps)?;
        into.xx = from.xx;
        into.yy = from.yy;
        into.zz = from.zz;
        into.reference = from.reference.clone();
        // Rewrite the channel slots one texel at a time.
        let texels = from.texel_count();
        let stride = from.comps.count as usize;
        let mut data = vec![0u32; texels * stride];
        for t in 0..texels {
            for c in 0..4 {
                if let (Some(dst_slot), Some(src_slot)) = (into.comps.slot(c), from.comps.slot(c)) {
                    data[t * stride + dst_slot as usize] =
                        from.data[t * stride + src_slot as usize];
                }
            }
        }
        into.data = data;
        Ok(())
    }

    fn copy_from_struct(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        let str_val = other.as_aggregate()?;
        let names = arena.get(str_val.ty()).names().to_vec();
        let field = |name: &str| -> Result<&Value> {
            names
                .iter()
                .position(|n| n == name)
                .and_then(|i| str_val.get(i).ok())
                .ok_or_else(|| anyhow!("image struct is missing field \"{}\"", name))
        };

        let dims = field("dim")?.extract_uvec("dim", {
            let v = field("dim")?.as_aggregate()?;
            v.len()
        })?;
        let comps_raw = field("comps")?.extract_u32("comps")?;
        let comps = Component::decode(comps_raw, true)?;
        let data_arr = field("data")?.as_aggregate()?;

        let mut inner = self.inner.borrow_mut();
        inner.reference = match field("ref") {
            Ok(Value::String(_, s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };
        inner.comps = comps;
        inner.xx = dims.first().copied().unwrap_or(0);
        inner.yy = dims.get(1).copied().unwrap_or(0);
        inner.zz = dims.get(2).copied().unwrap_or(0);

        let expected = inner.texel_count() * inner.comps.count as usize;
        if data_arr.len() != expected {
            bail!(
                "image data has {} entries, but {} x {} x {} with {} active channels requires {}",
                data_arr.len(),
                inner.xx,
                inner.yy,
                inner.zz,
                inner.comps.count,
                expected
            );
        }
        inner.data = data_arr
            .elements()
            .iter()
            .map(|v| v.as_primitive().map(Primitive::bits))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Externalisable struct form.
    pub fn to_struct(&self, arena: &mut TypeArena) -> Result<Value> {
        use crate::ty::Type;
        let inner = self.inner.borrow();
        let mut dims = vec![Value::Primitive(Primitive::uint(arena, inner.xx))];
        if inner.yy > 0 {
            dims.push(Value::Primitive(Primitive::uint(arena, inner.yy)));
            if inner.zz > 0 {
                dims.push(Value::Primitive(Primitive::uint(arena, inner.zz)));
            }
        }
        let texel_ty = arena.get(self.ty).element().unwrap_or_else(|_| arena.f32());
        let dim_ty = arena.intern(Type::array(dims.len() as u32, arena.u32()));
        let data_ty = arena.intern(Type::array(inner.data.len() as u32, texel_ty));
        let fields = vec![arena.string(), dim_ty, arena.u32(), data_ty];
        let names = vec![
            "ref".to_owned(),
            "dim".to_owned(),
            "comps".to_owned(),
            "data".to_owned(),
        ];
        let st_ty = arena.intern(Type::structure_named(fields, names));

        let data = inner
            .data
            .iter()
            .map(|&bits| {
                let mut p = Primitive::zeroed(texel_ty);
                p.set_bits(bits);
                Value::Primitive(p)
            })
            .collect();
        let dims_val = Value::Array(crate::value::Aggregate::new(dim_ty, dims));
        let data_val = Value::Array(crate::value::Aggregate::new(data_ty, data));
        let reference = Value::String(
            arena.string(),
            inner.reference.clone().unwrap_or_default(),
        );
        let comps = Value::Primitive(Primitive::uint(arena, inner.comps.encode()));
        Ok(Value::Struct(crate::value::Aggregate::new(
            st_ty,
            vec![reference, dims_val, comps, data_val],
        )))
    }
}

/// A sampler: a default level of detail plus a mip chain, largest first.
#[derive(Clone, Debug)]
pub struct Sampler {
    ty: TypeHandle,
    lod: u32,
    mipmaps: Vec<Image>,
}

impl Sampler {
    pub fn empty(ty: TypeHandle) -> Sampler {
        Sampler {
            ty,
            lod: 0,
            mipmaps: Vec::new(),
        }
    }

    /// Combine a lone image into a single-mip sampler, sharing its texels.
    pub fn from_image(ty: TypeHandle, image: Image) -> Sampler {
        Sampler {
            ty,
            lod: 0,
            mipmaps: vec![image],
        }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn lod(&self) -> u32 {
        self.lod
    }
    pub fn mip(&self, level: u32) -> Result<&Image> {
        self.mipmaps
            .get(level as usize)
            .ok_or_else(|| anyhow!("sampler has no mipmap at level {}", level))
    }

    pub fn copy_from(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        match other {
            Value::Sampler(src) => {
                self.lod = src.lod;
                self.mipmaps = src.mipmaps.clone();
                Ok(())
            }
            Value::Struct(str_val) => {
                let names = arena.get(str_val.ty()).names().to_vec();
                let lod_at = names
                    .iter()
                    .position(|n| n == "lod")
                    .ok_or_else(|| anyhow!("sampler struct is missing field \"lod\""))?;
                let mips_at = names
                    .iter()
                    .position(|n| n == "mipmaps")
                    .ok_or_else(|| anyhow!("sampler struct is missing field \"mipmaps\""))?;
                self.lod = str_val.get(lod_at)?.extract_u32("lod")?;
                let mips = str_val.get(mips_at)?.as_aggregate()?;
                if mips.is_empty() {
                    bail!("sampler needs at least one mipmap");
                }
                if self.lod as usize >= mips.len() {
                    bail!(
                        "sampler lod {} is out of range for {} mipmaps",
                        self.lod,
                        mips.len()
                    );
                }
                let image_ty = {
                    let sub = arena.get(self.ty).element().unwrap_or_else(|_| self.ty);
                    sub
                };
                self.mipmaps.clear();
                for m in mips.elements() {
                    let mut img = Image::empty(arena, image_ty)?;
                    img.copy_from(m, arena)?;
                    self.mipmaps.push(img);
                }
                Ok(())
            }
            _ => bail!("type mismatch: cannot copy sampler from a non-sampler value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;

    #[test]
    fn component_decoding() {
        let rgba = Component::decode(1234, true).unwrap();
        assert_eq!(rgba.count(), 4);
        assert_eq!(rgba.slot(0), Some(0));
        assert_eq!(rgba.slot(3), Some(3));

        // 2341 = ARGB: alpha stored first.
        let argb = Component::decode(2341, true).unwrap();
        assert_eq!(argb.slot(3), Some(0));
        assert_eq!(argb.slot(0), Some(1));

        // R only.
        let r = Component::decode(1000, true).unwrap();
        assert_eq!(r.count(), 1);
        assert_eq!(r.slot(0), Some(0));
        assert_eq!(r.slot(1), None);

        assert!(Component::decode(0, true).is_err());
        assert!(Component::decode(1134, true).is_err());
        assert!(Component::decode(4000, true).is_err());
    }

    #[test]
    fn loads_share_texels() {
        let mut arena = TypeArena::new();
        let f = arena.f32();
        let img_ty = arena.intern(Type::image(1, 1000, f));
        let a = Image::empty(&arena, img_ty).unwrap();
        let b = a.clone();
        assert!(a.shares_storage(&b));
    }
}
