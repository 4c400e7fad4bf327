// Jungfrau raw word: bits 15,14 carry the gain range, bits 13..0 the ADC value
//   00 -> G0 (range 0), 01 -> G1 (range 1), 11 -> G2 (range 2), 10 -> invalid
pub const JUNGFRAU_DATA_MASK: u16 = 0x3fff;
pub const JUNGFRAU_BW1: u16 = 0x4000;
pub const JUNGFRAU_BW2: u16 = 0x8000;
pub const JUNGFRAU_BW3: u16 = 0xc000;
pub const JUNGFRAU_GAIN_RANGES: [&str; 3] = ["G0", "G1", "G2"];
pub const JUNGFRAU_SEGMENT_ROWS: usize = 512;
pub const JUNGFRAU_SEGMENT_COLS: usize = 1024;
pub const JUNGFRAU_BANK_ROWS: usize = 256;
pub const JUNGFRAU_BANK_COLS: usize = 64;
pub const JUNGFRAU_ASIC_ROWS: usize = 256;
pub const JUNGFRAU_ASIC_COLS: usize = 256;

// Epix10ka raw word: bit 14 is the adaptive-mode switch bit, bits 13..0 the ADC value.
// The per-pixel control word combines configuration with the data bit:
//   bit 2 (4)  - g gain bit
//   bit 3 (8)  - ga gain bit
//   bit 4 (16) - trbit, 1/0 for H/M
//   bit 5 (32) - data bit 14, 1/0 for L/(H,M)
pub const EPIX10KA_DATA_MASK: u16 = 0x3fff;
pub const EPIX10KA_DATA_BIT: u16 = 0x4000;
pub const EPIX10KA_DATA_BIT_SHIFT: u32 = 9;
pub const EPIX10KA_CONFIG_BITS: u8 = 0b01_1100;
pub const EPIX10KA_GAIN_RANGES: [&str; 7] = ["FH", "FM", "FL", "AHL-H", "AML-M", "AHL-L", "AML-L"];
pub const EPIX10KA_SEGMENT_ROWS: usize = 352;
pub const EPIX10KA_SEGMENT_COLS: usize = 384;
pub const EPIX10KA_BANK_ROWS: usize = 176;
pub const EPIX10KA_BANK_COLS: usize = 48;
pub const EPIX10KA_ASIC_ROWS: usize = 176;
pub const EPIX10KA_ASIC_COLS: usize = 192;

/// Range id for a pixel that matched none of the named gain ranges
pub const UNCLASSIFIED: u8 = u8::MAX;

// Values given to unclassified pixels by the constant selector
pub const DEFAULT_PEDESTAL: f32 = 0.0;
pub const DEFAULT_INVERSE_GAIN: f32 = 1.0;

/// Stored common-mode arrays may omit the minimum pixel count
pub const DEFAULT_MIN_PIXEL_COUNT: usize = 10;

/// Emit gain range statistics every this many events per detector
pub const DIAGNOSTIC_PERIOD: u64 = 100;
