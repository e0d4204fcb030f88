//! Pure-Rust ISO-BMFF (MP4/MOV) sample source.
//!
//! Reads the sample tables of the first video track and slices every sample's
//! payload out of the file buffer without copying. Edit lists and fragmented
//! files (`moof`) are not interpreted.

use bytes::Bytes;

use super::atoms::{Atom, AtomIter, BoxReader, find_atom};
use super::{SampleSource, SourceError, SourceResult};
use crate::media::{
    CodecString, ContainerFormat, Sample, TrackMetadata, detect_container_format,
};

/// Size of the fixed part of a `VisualSampleEntry` body.
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

/// Video track demultiplexed from an MP4 or QuickTime file.
#[derive(Debug, Clone)]
pub struct Mp4SampleSource {
    container: ContainerFormat,
    track: TrackMetadata,
    samples: Vec<Sample>,
}

struct SampleEntry {
    width: u32,
    height: u32,
    codec: String,
    description: Bytes,
}

struct StscEntry {
    first_chunk: u32,
    samples_per_chunk: u32,
}

impl Mp4SampleSource {
    /// Parses the file and builds the sample list of its first video track.
    ///
    /// # Errors
    ///
    /// - `SourceError::NoVideoTrack` - No track with a `vide` handler
    /// - `SourceError::UnsupportedCodec` - Sample entry is not AVC, HEVC, VP9 or AV1
    /// - `SourceError::Malformed` - Missing or inconsistent boxes
    pub fn parse(data: Bytes) -> SourceResult<Self> {
        let container = match detect_container_format(&data) {
            Ok(format) if format.is_iso_bmff() => format,
            _ => ContainerFormat::Mp4,
        };

        let moov = find_atom(AtomIter::new(&data, 0), b"moov")?.ok_or_else(|| {
            SourceError::Malformed {
                reason: "missing moov box".to_string(),
            }
        })?;
        let movie_duration = moov.child(b"mvhd")?.map(parse_mvhd).transpose()?;

        for trak in moov.children() {
            let trak = trak?;
            if &trak.kind != b"trak" {
                continue;
            }
            let mdia = trak.require(b"mdia")?;
            if handler_type(&mdia.require(b"hdlr")?)? != *b"vide" {
                continue;
            }

            let (track, samples) = parse_video_track(&data, &trak, &mdia, movie_duration)?;
            tracing::debug!(
                "Parsed {} video track {}: {}x{} {} with {} samples",
                container,
                track.track_id,
                track.width,
                track.height,
                track.codec,
                samples.len()
            );
            return Ok(Self {
                container,
                track,
                samples,
            });
        }

        Err(SourceError::NoVideoTrack)
    }
}

impl SampleSource for Mp4SampleSource {
    fn container(&self) -> ContainerFormat {
        self.container
    }

    fn track_metadata(&self) -> Option<&TrackMetadata> {
        Some(&self.track)
    }

    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

fn handler_type(hdlr: &Atom<'_>) -> SourceResult<[u8; 4]> {
    let mut reader = BoxReader::new(hdlr.body, "hdlr");
    reader.full_box_header()?;
    reader.skip(4)?; // pre_defined
    reader.fourcc()
}

/// Movie timescale and duration.
fn parse_mvhd(mvhd: Atom<'_>) -> SourceResult<(u32, u64)> {
    parse_time_header(mvhd, "mvhd")
}

/// Timescale and duration from `mvhd` or `mdhd`, which share their prefix.
fn parse_time_header(atom: Atom<'_>, context: &'static str) -> SourceResult<(u32, u64)> {
    let mut reader = BoxReader::new(atom.body, context);
    let (version, _) = reader.full_box_header()?;
    if version == 1 {
        reader.skip(16)?;
        let timescale = reader.u32()?;
        let duration = reader.u64()?;
        Ok((timescale, if duration == u64::MAX { 0 } else { duration }))
    } else {
        reader.skip(8)?;
        let timescale = reader.u32()?;
        let duration = reader.u32()?;
        Ok((timescale, if duration == u32::MAX { 0 } else { u64::from(duration) }))
    }
}

fn parse_track_id(trak: &Atom<'_>) -> SourceResult<u32> {
    let Some(tkhd) = trak.child(b"tkhd")? else {
        return Ok(1);
    };
    let mut reader = BoxReader::new(tkhd.body, "tkhd");
    let (version, _) = reader.full_box_header()?;
    reader.skip(if version == 1 { 16 } else { 8 })?;
    reader.u32()
}

fn parse_video_track(
    data: &Bytes,
    trak: &Atom<'_>,
    mdia: &Atom<'_>,
    movie_duration: Option<(u32, u64)>,
) -> SourceResult<(TrackMetadata, Vec<Sample>)> {
    let track_id = parse_track_id(trak)?;
    let (time_base, media_duration) = parse_time_header(mdia.require(b"mdhd")?, "mdhd")?;
    if time_base == 0 {
        return Err(SourceError::Malformed {
            reason: "mdhd timescale is zero".to_string(),
        });
    }

    let duration_ticks = if media_duration > 0 {
        Some(media_duration)
    } else {
        movie_duration
            .filter(|&(scale, duration)| scale > 0 && duration > 0)
            .map(|(scale, duration)| {
                let ticks = u128::from(duration) * u128::from(time_base) / u128::from(scale);
                ticks.min(u128::from(u64::MAX)) as u64
            })
    };

    let stbl = mdia.require(b"minf")?.require(b"stbl")?;
    let entry = parse_sample_entry(&stbl.require(b"stsd")?)?;
    let samples = build_samples(data, &stbl)?;

    let track = TrackMetadata {
        track_id,
        width: entry.width,
        height: entry.height,
        time_base,
        codec: entry.codec,
        description: Some(entry.description),
        duration_ticks,
    };
    Ok((track, samples))
}

fn parse_sample_entry(stsd: &Atom<'_>) -> SourceResult<SampleEntry> {
    let mut reader = BoxReader::new(stsd.body, "stsd");
    reader.full_box_header()?;
    if reader.u32()? == 0 {
        return Err(SourceError::Malformed {
            reason: "stsd has no sample entries".to_string(),
        });
    }

    let entry = stsd
        .children_after(8)?
        .next()
        .ok_or_else(|| SourceError::Malformed {
            reason: "stsd sample entry missing".to_string(),
        })??;

    let mut reader = BoxReader::new(entry.body, "sample entry");
    reader.skip(24)?;
    let width = u32::from(reader.u16()?);
    let height = u32::from(reader.u16()?);

    let (config_kind, derive): (&[u8; 4], fn(&[u8]) -> Option<CodecString>) = match &entry.kind {
        b"avc1" | b"avc3" => (b"avcC", CodecString::from_avc_config),
        b"hvc1" => (b"hvcC", |body: &[u8]| CodecString::from_hevc_config(false, body)),
        b"hev1" => (b"hvcC", |body: &[u8]| CodecString::from_hevc_config(true, body)),
        b"vp09" => (b"vpcC", CodecString::from_vp9_config),
        b"av01" => (b"av1C", CodecString::from_av1_config),
        _ => {
            return Err(SourceError::UnsupportedCodec {
                fourcc: entry.kind_str(),
            });
        }
    };

    let config = find_atom(entry.children_after(VISUAL_SAMPLE_ENTRY_LEN)?, config_kind)?
        .ok_or_else(|| SourceError::Malformed {
            reason: format!(
                "{} sample entry has no {} box",
                entry.kind_str(),
                String::from_utf8_lossy(config_kind)
            ),
        })?;

    let mut codec = derive(config.body).ok_or_else(|| SourceError::Malformed {
        reason: format!("unreadable {} record", String::from_utf8_lossy(config_kind)),
    })?;
    if &entry.kind == b"avc3" {
        if let CodecString::Avc {
            in_band_parameters, ..
        } = &mut codec
        {
            *in_band_parameters = true;
        }
    }

    Ok(SampleEntry {
        width,
        height,
        codec: codec.to_string(),
        description: Bytes::copy_from_slice(config.body),
    })
}

/// Expands run-length `(count, value)` tables.
fn read_runs(atom: &Atom<'_>, context: &'static str) -> SourceResult<Vec<(u32, u32)>> {
    let mut reader = BoxReader::new(atom.body, context);
    reader.full_box_header()?;
    let count = reader.entry_count(8)?;
    (0..count)
        .map(|_| Ok((reader.u32()?, reader.u32()?)))
        .collect()
}

fn expand_runs(runs: &[(u32, u32)], limit: usize) -> Vec<u32> {
    let mut values = Vec::with_capacity(limit);
    for &(count, value) in runs {
        let take = (count as usize).min(limit - values.len());
        values.extend(std::iter::repeat_n(value, take));
        if values.len() == limit {
            break;
        }
    }
    values
}

fn read_sample_sizes(stsz: &Atom<'_>, file_len: usize) -> SourceResult<Vec<u32>> {
    let mut reader = BoxReader::new(stsz.body, "stsz");
    reader.full_box_header()?;
    let uniform = reader.u32()?;
    if uniform == 0 {
        let count = reader.entry_count(4)?;
        return (0..count).map(|_| reader.u32()).collect();
    }
    let count = reader.u32()? as usize;
    if count > file_len {
        return Err(SourceError::Malformed {
            reason: format!("stsz lists {count} samples in a {file_len} byte file"),
        });
    }
    Ok(vec![uniform; count])
}

fn read_chunk_offsets(stbl: &Atom<'_>) -> SourceResult<Vec<u64>> {
    if let Some(stco) = stbl.child(b"stco")? {
        let mut reader = BoxReader::new(stco.body, "stco");
        reader.full_box_header()?;
        let count = reader.entry_count(4)?;
        return (0..count).map(|_| reader.u32().map(u64::from)).collect();
    }
    let co64 = stbl.require(b"co64")?;
    let mut reader = BoxReader::new(co64.body, "co64");
    reader.full_box_header()?;
    let count = reader.entry_count(8)?;
    (0..count).map(|_| reader.u64()).collect()
}

fn read_sample_to_chunk(stsc: &Atom<'_>) -> SourceResult<Vec<StscEntry>> {
    let mut reader = BoxReader::new(stsc.body, "stsc");
    reader.full_box_header()?;
    let count = reader.entry_count(12)?;
    (0..count)
        .map(|_| {
            let first_chunk = reader.u32()?;
            let samples_per_chunk = reader.u32()?;
            reader.skip(4)?; // sample_description_index
            Ok(StscEntry {
                first_chunk,
                samples_per_chunk,
            })
        })
        .collect()
}

fn read_sync_samples(stbl: &Atom<'_>) -> SourceResult<Option<Vec<u32>>> {
    let Some(stss) = stbl.child(b"stss")? else {
        return Ok(None);
    };
    let mut reader = BoxReader::new(stss.body, "stss");
    reader.full_box_header()?;
    let count = reader.entry_count(4)?;
    let mut numbers = (0..count)
        .map(|_| reader.u32())
        .collect::<SourceResult<Vec<_>>>()?;
    numbers.sort_unstable();
    Ok(Some(numbers))
}

/// File offset of every sample, following the chunk layout.
fn sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sizes: &[u32],
) -> SourceResult<Vec<u64>> {
    let malformed = |reason: &str| SourceError::Malformed {
        reason: reason.to_string(),
    };
    let mut offsets = Vec::with_capacity(sizes.len());

    for (index, entry) in stsc.iter().enumerate() {
        let end_chunk = stsc
            .get(index + 1)
            .map_or(chunk_offsets.len() as u64 + 1, |next| u64::from(next.first_chunk));
        if entry.first_chunk == 0 || end_chunk < u64::from(entry.first_chunk) {
            return Err(malformed("stsc chunk numbers out of order"));
        }

        for chunk in u64::from(entry.first_chunk)..end_chunk {
            let mut offset = *chunk_offsets
                .get((chunk - 1) as usize)
                .ok_or_else(|| malformed("stsc references a missing chunk"))?;
            for _ in 0..entry.samples_per_chunk {
                let Some(&size) = sizes.get(offsets.len()) else {
                    return Ok(offsets);
                };
                offsets.push(offset);
                offset = offset
                    .checked_add(u64::from(size))
                    .ok_or_else(|| malformed("sample offset overflows"))?;
            }
        }
    }

    if offsets.len() < sizes.len() {
        return Err(malformed("chunk layout covers fewer samples than stsz"));
    }
    Ok(offsets)
}

fn build_samples(data: &Bytes, stbl: &Atom<'_>) -> SourceResult<Vec<Sample>> {
    let sizes = read_sample_sizes(&stbl.require(b"stsz")?, data.len())?;
    let count = sizes.len();
    if count == 0 {
        return Ok(Vec::new());
    }

    let durations = expand_runs(&read_runs(&stbl.require(b"stts")?, "stts")?, count);
    if durations.len() < count {
        return Err(SourceError::Malformed {
            reason: format!("stts covers {} of {count} samples", durations.len()),
        });
    }
    let composition_offsets = match stbl.child(b"ctts")? {
        Some(ctts) => expand_runs(&read_runs(&ctts, "ctts")?, count),
        None => Vec::new(),
    };
    let sync = read_sync_samples(stbl)?;
    let offsets = sample_offsets(
        &read_sample_to_chunk(&stbl.require(b"stsc")?)?,
        &read_chunk_offsets(stbl)?,
        &sizes,
    )?;

    let mut samples = Vec::with_capacity(count);
    let mut decode_time: i64 = 0;
    for index in 0..count {
        let start = usize::try_from(offsets[index]).unwrap_or(usize::MAX);
        let end = start.saturating_add(sizes[index] as usize);
        if end > data.len() {
            return Err(SourceError::Malformed {
                reason: format!("sample {index} lies outside the file"),
            });
        }

        // Composition offsets are signed in version 1 and, in practice, in version 0 too.
        let composition = composition_offsets.get(index).map_or(0, |&offset| offset as i32);
        let sample_number = index as u32 + 1;

        samples.push(Sample {
            data: data.slice(start..end),
            timestamp: decode_time + i64::from(composition),
            duration: u64::from(durations[index]),
            is_random_access: sync
                .as_ref()
                .is_none_or(|numbers| numbers.binary_search(&sample_number).is_ok()),
        });
        decode_time += i64::from(durations[index]);
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut data = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(kind);
        data.extend_from_slice(body);
        data
    }

    fn full(kind: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut content = vec![version, 0, 0, 0];
        content.extend_from_slice(body);
        boxed(kind, &content)
    }

    fn table(entries: &[&[u32]]) -> Vec<u8> {
        let mut body = (entries.len() as u32).to_be_bytes().to_vec();
        for entry in entries {
            for value in *entry {
                body.extend_from_slice(&value.to_be_bytes());
            }
        }
        body
    }

    struct Fixture {
        sizes: Vec<u32>,
        delta: u32,
        samples_per_chunk: u32,
        sync: Option<Vec<u32>>,
        ctts: Option<Vec<u32>>,
        mdhd_duration: u32,
        handler: [u8; 4],
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                sizes: vec![100, 40, 40, 60],
                delta: 512,
                samples_per_chunk: 2,
                sync: Some(vec![1, 4]),
                ctts: None,
                mdhd_duration: 2_048,
                handler: *b"vide",
            }
        }
    }

    fn build(fixture: &Fixture) -> Vec<u8> {
        let ftyp = boxed(b"ftyp", b"isom\0\0\0\0isomavc1");
        let payload: Vec<u8> = fixture
            .sizes
            .iter()
            .enumerate()
            .flat_map(|(index, &size)| std::iter::repeat_n(index as u8, size as usize))
            .collect();
        let mdat = boxed(b"mdat", &payload);
        let data_start = (ftyp.len() + 8) as u32;

        let mut chunk_offsets = Vec::new();
        let mut offset = data_start;
        for chunk in fixture.sizes.chunks(fixture.samples_per_chunk as usize) {
            chunk_offsets.push(offset);
            offset += chunk.iter().sum::<u32>();
        }

        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&640u16.to_be_bytes());
        entry.extend_from_slice(&360u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; VISUAL_SAMPLE_ENTRY_LEN - 28]);
        entry.extend(boxed(b"avcC", &[1, 0x64, 0x00, 0x1F, 0xFF, 0xE1]));
        let mut stsd_body = 1u32.to_be_bytes().to_vec();
        stsd_body.extend(boxed(b"avc1", &entry));
        let stsd = full(b"stsd", 0, &stsd_body);

        let count = fixture.sizes.len() as u32;
        let mut stbl = stsd;
        stbl.extend(full(b"stts", 0, &table(&[&[count, fixture.delta]])));
        if let Some(ctts) = &fixture.ctts {
            let runs: Vec<[u32; 2]> = ctts.iter().map(|&offset| [1, offset]).collect();
            let refs: Vec<&[u32]> = runs.iter().map(|run| &run[..]).collect();
            stbl.extend(full(b"ctts", 0, &table(&refs)));
        }
        stbl.extend(full(b"stsc", 0, &table(&[&[1, fixture.samples_per_chunk, 1]])));
        let mut stsz = vec![0u8; 4];
        stsz.extend(table(&fixture.sizes.iter().map(std::slice::from_ref).collect::<Vec<_>>()));
        stbl.extend(full(b"stsz", 0, &stsz));
        stbl.extend(full(
            b"stco",
            0,
            &table(&chunk_offsets.iter().map(std::slice::from_ref).collect::<Vec<_>>()),
        ));
        if let Some(sync) = &fixture.sync {
            let numbers: Vec<&[u32]> = sync.iter().map(std::slice::from_ref).collect();
            stbl.extend(full(b"stss", 0, &table(&numbers)));
        }

        let mut mdhd = vec![0u8; 8];
        mdhd.extend_from_slice(&15_360u32.to_be_bytes());
        mdhd.extend_from_slice(&fixture.mdhd_duration.to_be_bytes());
        mdhd.extend_from_slice(&[0u8; 4]);

        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(&fixture.handler);
        hdlr.extend_from_slice(&[0u8; 13]);

        let mut tkhd = vec![0u8; 8];
        tkhd.extend_from_slice(&7u32.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 72]);

        let minf = boxed(b"minf", &boxed(b"stbl", &stbl));
        let mdia = boxed(
            b"mdia",
            &[full(b"mdhd", 0, &mdhd), full(b"hdlr", 0, &hdlr), minf].concat(),
        );
        let trak = boxed(b"trak", &[full(b"tkhd", 0, &tkhd), mdia].concat());

        let mut mvhd = vec![0u8; 8];
        mvhd.extend_from_slice(&1_000u32.to_be_bytes());
        mvhd.extend_from_slice(&2_000u32.to_be_bytes());
        mvhd.extend_from_slice(&[0u8; 80]);
        let moov = boxed(b"moov", &[full(b"mvhd", 0, &mvhd), trak].concat());

        [ftyp, mdat, moov].concat()
    }

    #[test]
    fn test_parse_track_metadata() {
        let source = Mp4SampleSource::parse(Bytes::from(build(&Fixture::default()))).unwrap();
        let track = source.track_metadata().unwrap();

        assert_eq!(source.container(), ContainerFormat::Mp4);
        assert_eq!(track.track_id, 7);
        assert_eq!((track.width, track.height), (640, 360));
        assert_eq!(track.time_base, 15_360);
        assert_eq!(track.codec, "avc1.64001f");
        assert_eq!(track.description.as_deref(), Some(&[1, 0x64, 0x00, 0x1F, 0xFF, 0xE1][..]));
        assert_eq!(track.duration_ticks, Some(2_048));
    }

    #[test]
    fn test_parse_samples_and_payloads() {
        let source = Mp4SampleSource::parse(Bytes::from(build(&Fixture::default()))).unwrap();
        let samples = source.samples();

        assert_eq!(samples.len(), 4);
        let timestamps: Vec<i64> = samples.iter().map(|sample| sample.timestamp).collect();
        assert_eq!(timestamps, vec![0, 512, 1_024, 1_536]);
        let sizes: Vec<usize> = samples.iter().map(|sample| sample.data.len()).collect();
        assert_eq!(sizes, vec![100, 40, 40, 60]);
        for (index, sample) in samples.iter().enumerate() {
            assert!(sample.data.iter().all(|&byte| byte == index as u8));
            assert_eq!(sample.duration, 512);
        }
        let keys: Vec<bool> = samples.iter().map(|sample| sample.is_random_access).collect();
        assert_eq!(keys, vec![true, false, false, true]);
    }

    #[test]
    fn test_missing_stss_means_all_sync() {
        let fixture = Fixture {
            sync: None,
            ..Fixture::default()
        };
        let source = Mp4SampleSource::parse(Bytes::from(build(&fixture))).unwrap();
        assert!(source.samples().iter().all(|sample| sample.is_random_access));
    }

    #[test]
    fn test_composition_offsets_shift_timestamps() {
        let fixture = Fixture {
            ctts: Some(vec![1_024, 0xFFFF_FE00, 0, 512]),
            ..Fixture::default()
        };
        let source = Mp4SampleSource::parse(Bytes::from(build(&fixture))).unwrap();
        let timestamps: Vec<i64> = source.samples().iter().map(|sample| sample.timestamp).collect();
        assert_eq!(timestamps, vec![1_024, 0, 1_024, 2_048]);
    }

    #[test]
    fn test_movie_duration_fallback() {
        let fixture = Fixture {
            mdhd_duration: 0,
            ..Fixture::default()
        };
        let source = Mp4SampleSource::parse(Bytes::from(build(&fixture))).unwrap();
        // 2000 ms in the movie timescale converted to 15360 Hz
        assert_eq!(source.track_metadata().unwrap().duration_ticks, Some(30_720));
    }

    #[test]
    fn test_no_video_track() {
        let fixture = Fixture {
            handler: *b"soun",
            ..Fixture::default()
        };
        let result = Mp4SampleSource::parse(Bytes::from(build(&fixture)));
        assert!(matches!(result, Err(SourceError::NoVideoTrack)));
    }

    #[test]
    fn test_empty_sample_table() {
        let fixture = Fixture {
            sizes: Vec::new(),
            sync: None,
            ..Fixture::default()
        };
        let source = Mp4SampleSource::parse(Bytes::from(build(&fixture))).unwrap();
        assert!(source.samples().is_empty());
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let mut data = build(&Fixture::default());
        data.truncate(data.len() - 10);
        assert!(matches!(
            Mp4SampleSource::parse(Bytes::from(data)),
            Err(SourceError::Malformed { .. })
        ));
        assert!(Mp4SampleSource::parse(Bytes::from_static(b"\0\0\0\x10ftypisom\0\0\0\0")).is_err());
    }

    #[test]
    fn test_chunk_offset_overflow_is_malformed() {
        let stsc = [StscEntry {
            first_chunk: 1,
            samples_per_chunk: 2,
        }];
        let result = sample_offsets(&stsc, &[u64::MAX - 4], &[8, 8]);
        assert!(matches!(result, Err(SourceError::Malformed { .. })));

        assert_eq!(sample_offsets(&stsc, &[100], &[8, 8]).unwrap(), vec![100, 108]);
    }
}
