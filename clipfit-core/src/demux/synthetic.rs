//! Generated sample sources for tests and simulation runs.

use bytes::Bytes;

use super::SampleSource;
use crate::media::{ContainerFormat, Sample, TrackMetadata};

/// A video track made up on the spot: regular frame timing, a keyframe every
/// `keyframe_interval` samples, and filler payloads.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    container: ContainerFormat,
    track: Option<TrackMetadata>,
    samples: Vec<Sample>,
}

impl SyntheticSource {
    pub fn builder() -> SyntheticSourceBuilder {
        SyntheticSourceBuilder::default()
    }
}

impl SampleSource for SyntheticSource {
    fn container(&self) -> ContainerFormat {
        self.container
    }

    fn track_metadata(&self) -> Option<&TrackMetadata> {
        self.track.as_ref()
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Builder for [`SyntheticSource`].
#[derive(Debug, Clone)]
pub struct SyntheticSourceBuilder {
    container: ContainerFormat,
    width: u32,
    height: u32,
    time_base: u32,
    frame_count: usize,
    frame_duration: u64,
    frame_durations: Option<Vec<u64>>,
    start_timestamp: i64,
    keyframe_interval: usize,
    sample_size: usize,
    codec: String,
    declared_duration: Option<u64>,
    without_video_track: bool,
}

impl Default for SyntheticSourceBuilder {
    fn default() -> Self {
        Self {
            container: ContainerFormat::Mp4,
            width: 1920,
            height: 1080,
            time_base: 30_000,
            frame_count: 30,
            frame_duration: 1_001,
            frame_durations: None,
            start_timestamp: 0,
            keyframe_interval: 30,
            sample_size: 256,
            codec: "avc1.640028".to_string(),
            declared_duration: None,
            without_video_track: false,
        }
    }
}

impl SyntheticSourceBuilder {
    pub fn container(mut self, container: ContainerFormat) -> Self {
        self.container = container;
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Regular timing: `count` frames of `duration` ticks at `time_base` Hz.
    pub fn frames(mut self, count: usize, duration: u64, time_base: u32) -> Self {
        self.frame_count = count;
        self.frame_duration = duration;
        self.time_base = time_base;
        self.frame_durations = None;
        self
    }

    /// Irregular timing, one duration per frame.
    pub fn frame_durations(mut self, durations: Vec<u64>, time_base: u32) -> Self {
        self.frame_count = durations.len();
        self.frame_durations = Some(durations);
        self.time_base = time_base;
        self
    }

    pub fn start_timestamp(mut self, ticks: i64) -> Self {
        self.start_timestamp = ticks;
        self
    }

    pub fn keyframe_interval(mut self, interval: usize) -> Self {
        self.keyframe_interval = interval.max(1);
        self
    }

    pub fn sample_size(mut self, bytes: usize) -> Self {
        self.sample_size = bytes;
        self
    }

    pub fn codec(mut self, codec: &str) -> Self {
        self.codec = codec.to_string();
        self
    }

    pub fn declared_duration(mut self, ticks: u64) -> Self {
        self.declared_duration = Some(ticks);
        self
    }

    /// Produces a source that reports no video track.
    pub fn without_video_track(mut self) -> Self {
        self.without_video_track = true;
        self
    }

    pub fn build(self) -> SyntheticSource {
        let durations = self
            .frame_durations
            .unwrap_or_else(|| vec![self.frame_duration; self.frame_count]);

        let mut timestamp = self.start_timestamp;
        let samples = durations
            .iter()
            .enumerate()
            .map(|(index, &duration)| {
                let sample = Sample {
                    data: Bytes::from(vec![(index % 256) as u8; self.sample_size]),
                    timestamp,
                    duration,
                    is_random_access: index % self.keyframe_interval == 0,
                };
                timestamp += i64::try_from(duration).unwrap_or(i64::MAX);
                sample
            })
            .collect();

        let track = (!self.without_video_track).then(|| TrackMetadata {
            track_id: 1,
            width: self.width,
            height: self.height,
            time_base: self.time_base,
            codec: self.codec.clone(),
            description: None,
            duration_ticks: self.declared_duration,
        });

        SyntheticSource {
            container: self.container,
            track,
            samples,
        }
    }
}
