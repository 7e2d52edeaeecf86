use super::options::{
    AudioCodec, Container, Resolution, TranscodeOptions, VideoCodec, VideoQuality,
};

/// Named option template for common destinations
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub container: Container,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub crf: u8,
    pub encoder_preset: &'static str,
    pub resolution: Option<Resolution>,
    pub faststart: bool,
}

impl Preset {
    pub fn all() -> Vec<Preset> {
        vec![
            Preset {
                name: "YouTube Upload",
                description: "H.264/AAC MP4 at standard quality, streamable",
                container: Container::Mp4,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
                crf: 23,
                encoder_preset: "medium",
                resolution: None,
                faststart: true,
            },
            Preset {
                name: "WhatsApp Share",
                description: "720p MP4 small enough for messaging apps",
                container: Container::Mp4,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
                crf: 28,
                encoder_preset: "fast",
                resolution: Some(Resolution::new(1280, 720)),
                faststart: true,
            },
            Preset {
                name: "High Quality",
                description: "Visually lossless H.264 MP4",
                container: Container::Mp4,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
                crf: 18,
                encoder_preset: "slow",
                resolution: None,
                faststart: true,
            },
            Preset {
                name: "Small File Size",
                description: "480p MP4 at aggressive compression",
                container: Container::Mp4,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
                crf: 32,
                encoder_preset: "fast",
                resolution: Some(Resolution::new(854, 480)),
                faststart: true,
            },
            Preset {
                name: "Archive Quality",
                description: "HEVC video with lossless FLAC audio in MKV",
                container: Container::Mkv,
                video_codec: VideoCodec::Hevc,
                audio_codec: AudioCodec::Flac,
                crf: 16,
                encoder_preset: "slow",
                resolution: None,
                faststart: false,
            },
        ]
    }

    /// Look up a preset by name, ignoring case
    pub fn get(name: &str) -> Option<Preset> {
        Self::all()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn names() -> Vec<&'static str> {
        Self::all().iter().map(|p| p.name).collect()
    }

    /// Overwrite the encoding settings of `opts` with this preset's.
    /// Inputs, output, trim, filters and overwrite policy are left alone.
    pub fn apply(&self, opts: &mut TranscodeOptions) {
        opts.container = Some(self.container);
        opts.video_codec = Some(self.video_codec.clone());
        opts.audio_codec = Some(self.audio_codec.clone());
        opts.video_quality = Some(VideoQuality::Crf(self.crf));
        opts.encoder_preset = Some(self.encoder_preset.to_string());
        opts.resolution = self.resolution;
        opts.faststart = self.faststart;
    }
}
