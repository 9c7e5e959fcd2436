//! The `wfd_video_formats` grammar: per-table resolution enablement masks,
//! H.264 profile/level negotiation and best-common-format selection.

use shared::error::{Error, Result};

/// Resolution tables defined by the Wi-Fi Display spec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResolutionType {
    Cea = 0,
    Vesa = 1,
    Hh = 2,
}

pub const NUM_RESOLUTION_TYPES: usize = 3;

impl ResolutionType {
    pub fn from_index(index: usize) -> Option<ResolutionType> {
        match index {
            0 => Some(ResolutionType::Cea),
            1 => Some(ResolutionType::Vesa),
            2 => Some(ResolutionType::Hh),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfileType {
    ConstrainedBaseline = 0,
    ConstrainedHigh = 1,
}

pub const NUM_PROFILE_TYPES: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LevelType {
    L31 = 0,
    L32 = 1,
    L40 = 2,
    L41 = 3,
    L42 = 4,
}

pub const NUM_LEVEL_TYPES: usize = 5;

impl ProfileType {
    fn from_index(index: usize) -> ProfileType {
        if index == 1 {
            ProfileType::ConstrainedHigh
        } else {
            ProfileType::ConstrainedBaseline
        }
    }

    /// The (profile_idc, constraint_set) pair carried in an SPS.
    pub fn idc(&self) -> (u8, u8) {
        match self {
            ProfileType::ConstrainedBaseline => (66, 0xc0),
            ProfileType::ConstrainedHigh => (100, 0x0c),
        }
    }
}

impl LevelType {
    fn from_index(index: usize) -> LevelType {
        match index {
            1 => LevelType::L32,
            2 => LevelType::L40,
            3 => LevelType::L41,
            4 => LevelType::L42,
            _ => LevelType::L31,
        }
    }

    pub fn idc(&self) -> u8 {
        match self {
            LevelType::L31 => 31,
            LevelType::L32 => 32,
            LevelType::L40 => 40,
            LevelType::L41 => 41,
            LevelType::L42 => 42,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Config {
    width: u32,
    height: u32,
    frames_per_second: u32,
    interlaced: bool,
}

const fn cfg(width: u32, height: u32, frames_per_second: u32, interlaced: bool) -> Config {
    Config {
        width,
        height,
        frames_per_second,
        interlaced,
    }
}

const EMPTY: Config = cfg(0, 0, 0, false);

#[rustfmt::skip]
const RESOLUTION_TABLE: [[Config; 32]; NUM_RESOLUTION_TYPES] = [
    // CEA resolutions
    [
        cfg(640, 480, 60, false), cfg(720, 480, 60, false), cfg(720, 480, 60, true),
        cfg(720, 576, 50, false), cfg(720, 576, 50, true), cfg(1280, 720, 30, false),
        cfg(1280, 720, 60, false), cfg(1920, 1080, 30, false), cfg(1920, 1080, 60, false),
        cfg(1920, 1080, 60, true), cfg(1280, 720, 25, false), cfg(1280, 720, 50, false),
        cfg(1920, 1080, 25, false), cfg(1920, 1080, 50, false), cfg(1920, 1080, 50, true),
        cfg(1280, 720, 24, false), cfg(1920, 1080, 24, false),
        EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY,
        EMPTY, EMPTY, EMPTY, EMPTY,
    ],
    // VESA resolutions
    [
        cfg(800, 600, 30, false), cfg(800, 600, 60, false), cfg(1024, 768, 30, false),
        cfg(1024, 768, 60, false), cfg(1152, 864, 30, false), cfg(1152, 864, 60, false),
        cfg(1280, 768, 30, false), cfg(1280, 768, 60, false), cfg(1280, 800, 30, false),
        cfg(1280, 800, 60, false), cfg(1360, 768, 30, false), cfg(1360, 768, 60, false),
        cfg(1366, 768, 30, false), cfg(1366, 768, 60, false), cfg(1280, 1024, 30, false),
        cfg(1280, 1024, 60, false), cfg(1400, 1050, 30, false), cfg(1400, 1050, 60, false),
        cfg(1440, 900, 30, false), cfg(1440, 900, 60, false), cfg(1600, 900, 30, false),
        cfg(1600, 900, 60, false), cfg(1600, 1200, 30, false), cfg(1600, 1200, 60, false),
        cfg(1680, 1024, 30, false), cfg(1680, 1024, 60, false), cfg(1680, 1050, 30, false),
        cfg(1680, 1050, 60, false), cfg(1920, 1200, 30, false), cfg(1920, 1200, 60, false),
        EMPTY, EMPTY,
    ],
    // HH resolutions
    [
        cfg(800, 480, 30, false), cfg(800, 480, 60, false), cfg(854, 480, 30, false),
        cfg(854, 480, 60, false), cfg(864, 480, 30, false), cfg(864, 480, 60, false),
        cfg(640, 360, 30, false), cfg(640, 360, 60, false), cfg(960, 540, 30, false),
        cfg(960, 540, 60, false), cfg(848, 480, 30, false), cfg(848, 480, 60, false),
        EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY,
        EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY,
    ],
];

/// One peer's advertised video capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormats {
    resolution_enabled: [u32; NUM_RESOLUTION_TYPES],
    /// Per-entry profile and level bitmasks.
    profiles: [[u32; 32]; NUM_RESOLUTION_TYPES],
    levels: [[u32; 32]; NUM_RESOLUTION_TYPES],
    native_type: ResolutionType,
    native_index: usize,
}

impl Default for VideoFormats {
    fn default() -> Self {
        let mut formats = Self {
            resolution_enabled: [0; NUM_RESOLUTION_TYPES],
            profiles: [[0; 32]; NUM_RESOLUTION_TYPES],
            levels: [[0; 32]; NUM_RESOLUTION_TYPES],
            native_type: ResolutionType::Cea,
            native_index: 0,
        };
        // Default to 640x480 p60.
        formats.set_native_resolution(ResolutionType::Cea, 0);
        formats
    }
}

impl VideoFormats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolution parameters of a table entry, if defined.
    pub fn get_configuration(
        resolution_type: ResolutionType,
        index: usize,
    ) -> Option<(u32, u32, u32, bool)> {
        if index >= 32 {
            return None;
        }
        let config = &RESOLUTION_TABLE[resolution_type as usize][index];
        if config.width == 0 {
            return None;
        }
        Some((
            config.width,
            config.height,
            config.frames_per_second,
            config.interlaced,
        ))
    }

    pub fn set_native_resolution(&mut self, resolution_type: ResolutionType, index: usize) {
        assert!(Self::get_configuration(resolution_type, index).is_some());
        self.native_type = resolution_type;
        self.native_index = index;
        self.set_resolution_enabled(resolution_type, index, true);
    }

    pub fn native_resolution(&self) -> (ResolutionType, usize) {
        (self.native_type, self.native_index)
    }

    pub fn disable_all(&mut self) {
        self.resolution_enabled = [0; NUM_RESOLUTION_TYPES];
        self.profiles = [[0; 32]; NUM_RESOLUTION_TYPES];
        self.levels = [[0; 32]; NUM_RESOLUTION_TYPES];
    }

    pub fn enable_all(&mut self) {
        for i in 0..NUM_RESOLUTION_TYPES {
            self.resolution_enabled[i] = 0xffff_ffff;
            for j in 0..32 {
                self.profiles[i][j] = 1 << ProfileType::ConstrainedBaseline as u32;
                self.levels[i][j] = 1 << LevelType::L31 as u32;
            }
        }
    }

    pub fn set_resolution_enabled(
        &mut self,
        resolution_type: ResolutionType,
        index: usize,
        enabled: bool,
    ) {
        assert!(Self::get_configuration(resolution_type, index).is_some());

        let t = resolution_type as usize;
        if enabled {
            self.resolution_enabled[t] |= 1 << index;
            self.profiles[t][index] = 1 << ProfileType::ConstrainedBaseline as u32;
            self.levels[t][index] = 1 << LevelType::L31 as u32;
        } else {
            self.resolution_enabled[t] &= !(1 << index);
            self.profiles[t][index] = 0;
            self.levels[t][index] = 0;
        }
    }

    pub fn is_resolution_enabled(&self, resolution_type: ResolutionType, index: usize) -> bool {
        self.resolution_enabled[resolution_type as usize] & (1 << index) != 0
    }

    pub fn set_profile_level(
        &mut self,
        resolution_type: ResolutionType,
        index: usize,
        profile: ProfileType,
        level: LevelType,
    ) {
        let t = resolution_type as usize;
        self.profiles[t][index] = 1 << profile as u32;
        self.levels[t][index] = 1 << level as u32;
    }

    /// The best profile and level enabled on an entry, defaulting to
    /// constrained baseline 3.1 when nothing is set.
    pub fn profile_level(
        &self,
        resolution_type: ResolutionType,
        index: usize,
    ) -> (ProfileType, LevelType) {
        let t = resolution_type as usize;

        let best_profile = (0..NUM_PROFILE_TYPES)
            .rev()
            .find(|&i| self.profiles[t][index] & (1 << i) != 0);
        let best_level = (0..NUM_LEVEL_TYPES)
            .rev()
            .find(|&i| self.levels[t][index] & (1 << i) != 0);

        match (best_profile, best_level) {
            (Some(p), Some(l)) => (ProfileType::from_index(p), LevelType::from_index(l)),
            _ => (ProfileType::ConstrainedBaseline, LevelType::L31),
        }
    }

    /// Enables every table entry whose score does not exceed the given
    /// maximum resolution, with the given profile and level.
    pub fn enable_resolution_up_to(
        &mut self,
        resolution_type: ResolutionType,
        index: usize,
        profile: ProfileType,
        level: LevelType,
    ) {
        let Some((width, height, fps, interlaced)) =
            Self::get_configuration(resolution_type, index)
        else {
            log::error!("maximum resolution not found");
            return;
        };
        let max_score = width * height * fps * if interlaced { 1 } else { 2 };

        for i in 0..NUM_RESOLUTION_TYPES {
            let t = ResolutionType::from_index(i).unwrap();
            for j in 0..32 {
                if let Some((w, h, f, il)) = Self::get_configuration(t, j) {
                    if max_score >= w * h * f * if il { 1 } else { 2 } {
                        self.set_resolution_enabled(t, j, true);
                        self.set_profile_level(t, j, profile, level);
                    }
                }
            }
        }
    }

    fn parse_h264_codec(&mut self, spec: &str) -> Result<()> {
        let mut tokens = spec.split_whitespace();
        let profile = parse_hex(tokens.next(), 2)?;
        let level = parse_hex(tokens.next(), 2)?;
        let masks = [
            parse_hex(tokens.next(), 8)?,
            parse_hex(tokens.next(), 8)?,
            parse_hex(tokens.next(), 8)?,
        ];

        for (i, mask) in masks.iter().enumerate() {
            for j in 0..32 {
                if mask & (1 << j) != 0 {
                    self.resolution_enabled[i] |= 1 << j;
                    if profile > self.profiles[i][j] {
                        // Prefer the higher profile even if its level is
                        // lower.
                        self.profiles[i][j] = profile;
                        self.levels[i][j] = level;
                    } else if profile == self.profiles[i][j] && level > self.levels[i][j] {
                        self.levels[i][j] = level;
                    }
                }
            }
        }

        Ok(())
    }

    /// Parses a full `wfd_video_formats` value.
    pub fn parse_format_spec(&mut self, spec: &str) -> Result<()> {
        self.disable_all();

        let mut tokens = spec.split_whitespace();
        let native = parse_hex(tokens.next(), 2)?;
        let _preferred_display_mode_supported = parse_hex(tokens.next(), 2)?;

        let rest = spec
            .split_whitespace()
            .skip(2)
            .collect::<Vec<_>>()
            .join(" ");
        if rest.is_empty() {
            return Err(Error::ErrMalformedVideoFormats);
        }

        for codec_spec in rest.split(',') {
            self.parse_h264_codec(codec_spec.trim())?;
        }

        let native_index = (native >> 3) as usize;
        match ResolutionType::from_index((native & 7) as usize) {
            Some(native_type)
                if Self::get_configuration(native_type, native_index).is_some() =>
            {
                self.native_type = native_type;
                self.native_index = native_index;
            }
            _ => {
                // Some sinks advertise an illegal native resolution;
                // the value is advisory only.
                log::warn!("sink advertised an illegal native resolution, ignoring");
            }
        }

        Ok(())
    }

    /// Serializes the capability string, with the native byte zeroed for
    /// use inside an M4 request.
    pub fn format_spec(&self, for_m4_message: bool) -> String {
        let native = if for_m4_message {
            0
        } else {
            ((self.native_index << 3) | self.native_type as usize) as u32
        };

        format!(
            "{:02x} 00 {:02x} {:02x} {:08x} {:08x} {:08x} 00 0000 0000 00 none none",
            native,
            self.profiles[self.native_type as usize][self.native_index],
            self.levels[self.native_type as usize][self.native_index],
            self.resolution_enabled[0],
            self.resolution_enabled[1],
            self.resolution_enabled[2],
        )
    }

    /// Picks the best format enabled by both peers: maximize
    /// `width*height*fps*(interlaced ? 1 : 2)`, then intersect the profile
    /// and level downward.
    pub fn pick_best_format(
        sink_supported: &VideoFormats,
        source_supported: &VideoFormats,
    ) -> Result<(ResolutionType, usize, ProfileType, LevelType)> {
        let mut best: Option<(u32, ResolutionType, usize)> = None;

        for i in 0..NUM_RESOLUTION_TYPES {
            let t = ResolutionType::from_index(i).unwrap();
            for j in 0..32 {
                let Some((width, height, fps, interlaced)) = Self::get_configuration(t, j)
                else {
                    break;
                };

                if !sink_supported.is_resolution_enabled(t, j)
                    || !source_supported.is_resolution_enabled(t, j)
                {
                    continue;
                }

                let mut score = width * height * fps;
                if !interlaced {
                    score *= 2;
                }

                if best.map_or(true, |(best_score, _, _)| score > best_score) {
                    best = Some((score, t, j));
                }
            }
        }

        let Some((_, chosen_type, chosen_index)) = best else {
            return Err(Error::ErrNoCommonVideoFormat);
        };

        let (source_profile, source_level) =
            source_supported.profile_level(chosen_type, chosen_index);
        let (sink_profile, sink_level) = sink_supported.profile_level(chosen_type, chosen_index);

        Ok((
            chosen_type,
            chosen_index,
            source_profile.min(sink_profile),
            source_level.min(sink_level),
        ))
    }
}

fn parse_hex(token: Option<&str>, width: usize) -> Result<u32> {
    let token = token.ok_or(Error::ErrMalformedVideoFormats)?;
    if token.len() != width {
        return Err(Error::ErrMalformedVideoFormats);
    }
    u32::from_str_radix(token, 16).map_err(|_| Error::ErrMalformedVideoFormats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEA_720P30: &str = "00 00 02 02 00000020 00000000 00000000 00 0000 0000 00 none none";

    #[test]
    fn test_parse_720p30_spec() {
        let mut formats = VideoFormats::new();
        formats.parse_format_spec(CEA_720P30).unwrap();

        assert!(formats.is_resolution_enabled(ResolutionType::Cea, 5));
        assert!(!formats.is_resolution_enabled(ResolutionType::Cea, 6));
        assert_eq!(
            VideoFormats::get_configuration(ResolutionType::Cea, 5),
            Some((1280, 720, 30, false))
        );
    }

    #[test]
    fn test_pick_best_format_chooses_cea_index_5() {
        // §scenario 1: both sides advertise the 720p30 CEA mask; the chosen
        // format must be CEA index 5.
        let mut sink = VideoFormats::new();
        sink.parse_format_spec(CEA_720P30).unwrap();

        let mut source = VideoFormats::new();
        source.parse_format_spec(CEA_720P30).unwrap();

        let (chosen_type, chosen_index, profile, level) =
            VideoFormats::pick_best_format(&sink, &source).unwrap();
        assert_eq!(chosen_type, ResolutionType::Cea);
        assert_eq!(chosen_index, 5);
        // "02 02" advertises constrained high at level 3.2 on both sides.
        assert_eq!(profile, ProfileType::ConstrainedHigh);
        assert_eq!(level, LevelType::L32);
    }

    #[test]
    fn test_pick_best_prefers_higher_score() {
        let mut sink = VideoFormats::new();
        sink.enable_all();

        let mut source = VideoFormats::new();
        source.set_resolution_enabled(ResolutionType::Cea, 5, true); // 720p30
        source.set_resolution_enabled(ResolutionType::Cea, 7, true); // 1080p30

        let (t, i, _, _) = VideoFormats::pick_best_format(&sink, &source).unwrap();
        assert_eq!((t, i), (ResolutionType::Cea, 7));
    }

    #[test]
    fn test_progressive_beats_interlaced_at_same_rate() {
        let mut sink = VideoFormats::new();
        sink.enable_all();

        let mut source = VideoFormats::new();
        source.set_resolution_enabled(ResolutionType::Cea, 8, true); // 1080p60
        source.set_resolution_enabled(ResolutionType::Cea, 9, true); // 1080i60

        let (t, i, _, _) = VideoFormats::pick_best_format(&sink, &source).unwrap();
        assert_eq!((t, i), (ResolutionType::Cea, 8));
    }

    #[test]
    fn test_no_common_format() {
        let mut sink = VideoFormats::new();
        sink.disable_all();
        sink.resolution_enabled[0] = 1 << 5;

        let mut source = VideoFormats::new();
        source.disable_all();
        source.resolution_enabled[0] = 1 << 7;

        assert_eq!(
            VideoFormats::pick_best_format(&sink, &source),
            Err(Error::ErrNoCommonVideoFormat)
        );
    }

    #[test]
    fn test_format_spec_round_trip() {
        let mut formats = VideoFormats::new();
        formats.disable_all();
        formats.set_resolution_enabled(ResolutionType::Cea, 5, true);
        formats.set_native_resolution(ResolutionType::Cea, 5);

        let spec = formats.format_spec(false);
        assert!(spec.starts_with("28 00 "));
        assert!(spec.contains("00000020"));

        let mut parsed = VideoFormats::new();
        parsed.parse_format_spec(&spec).unwrap();
        assert!(parsed.is_resolution_enabled(ResolutionType::Cea, 5));
        assert_eq!(parsed.native_resolution(), (ResolutionType::Cea, 5));
    }

    #[test]
    fn test_m4_spec_zeroes_native() {
        let mut formats = VideoFormats::new();
        formats.disable_all();
        formats.set_resolution_enabled(ResolutionType::Cea, 5, true);
        formats.set_native_resolution(ResolutionType::Cea, 5);

        assert!(formats.format_spec(true).starts_with("00 00 "));
    }

    #[test]
    fn test_enable_resolution_up_to() {
        let mut formats = VideoFormats::new();
        formats.disable_all();
        formats.enable_resolution_up_to(
            ResolutionType::Cea,
            5,
            ProfileType::ConstrainedBaseline,
            LevelType::L31,
        );

        // 720p30 itself and everything smaller is on...
        assert!(formats.is_resolution_enabled(ResolutionType::Cea, 5));
        assert!(formats.is_resolution_enabled(ResolutionType::Cea, 0));
        assert!(formats.is_resolution_enabled(ResolutionType::Hh, 0));
        // ...but 720p60 and 1080p30 are not.
        assert!(!formats.is_resolution_enabled(ResolutionType::Cea, 6));
        assert!(!formats.is_resolution_enabled(ResolutionType::Cea, 7));
    }

    #[test]
    fn test_malformed_spec() {
        let mut formats = VideoFormats::new();
        assert!(formats.parse_format_spec("zz 00").is_err());
        assert!(formats.parse_format_spec("00").is_err());
    }
}
