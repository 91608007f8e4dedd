//! Ray flag bits, as SPIR-V defines them.

const OPAQUE: u32 = 0x1;
const NO_OPAQUE: u32 = 0x2;
const TERMINATE_ON_FIRST_HIT: u32 = 0x4;
const SKIP_CLOSEST_HIT_SHADER: u32 = 0x8;
const CULL_BACK_FACING_TRIANGLES: u32 = 0x10;
const CULL_FRONT_FACING_TRIANGLES: u32 = 0x20;
const CULL_OPAQUE: u32 = 0x40;
const CULL_NO_OPAQUE: u32 = 0x80;
const SKIP_TRIANGLES: u32 = 0x100;
const SKIP_AABBS: u32 = 0x200;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayFlags(u32);

impl RayFlags {
    /// Wrap a raw flag word. Opaque and no-opaque are mutually exclusive
    /// per the SPIR-V rules, but the word comes straight from executed
    /// instructions; the accessors read each bit independently, so a
    /// malformed combination degrades instead of failing the run.
    pub fn new(flags: u32) -> RayFlags {
        RayFlags(flags)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn none(self) -> bool {
        self.0 == 0
    }
    pub fn opaque(self) -> bool {
        self.0 & OPAQUE != 0
    }
    pub fn no_opaque(self) -> bool {
        self.0 & NO_OPAQUE != 0
    }
    pub fn terminate_on_first_hit(self) -> bool {
        self.0 & TERMINATE_ON_FIRST_HIT != 0
    }
    pub fn skip_closest_hit_shader(self) -> bool {
        self.0 & SKIP_CLOSEST_HIT_SHADER != 0
    }
    pub fn cull_back_facing_triangles(self) -> bool {
        self.0 & CULL_BACK_FACING_TRIANGLES != 0
    }
    pub fn cull_front_facing_triangles(self) -> bool {
        self.0 & CULL_FRONT_FACING_TRIANGLES != 0
    }
    pub fn cull_opaque(self) -> bool {
        self.0 & CULL_OPAQUE != 0
    }
    pub fn cull_no_opaque(self) -> bool {
        self.0 & CULL_NO_OPAQUE != 0
    }
    pub fn skip_triangles(self) -> bool {
        self.0 & SKIP_TRIANGLES != 0
    }
    pub fn skip_aabbs(self) -> bool {
        self.0 & SKIP_AABBS != 0
    }
}
