use crate::codec::{self, CodecParams};
use crate::demux::{Demuxer, SampleSink, TrackInfo, RELAY_TIMESCALE};
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{trace, warn};

struct CmafTrack {
    codec: String,
    timescale: u32,
    params: CodecParams,
    sample_rate: u32,
    channels: u16,
    is_video: bool,
}

#[derive(Default)]
struct TrunSample {
    duration: u32,
    size: u32,
    flags: u32,
    cts: i32,
}

struct PendingRun {
    track_id: u32,
    base_decode_time: u64,
    data_offset: Option<usize>,
    samples: Vec<TrunSample>,
}

/// Incremental CMAF/fMP4 parser: moov for init, moof+mdat for media.
///
/// Length-prefixed video samples are rewritten to Annex-B with parameter
/// sets prepended on keyframes so downstream consumers see the same shape
/// the TS demuxer produces.
pub struct CmafDemuxer {
    carry: BytesMut,
    tracks: HashMap<u32, CmafTrack>,
    announced: bool,
    video_track: Option<u32>,
    audio_track: Option<u32>,
    pending: Vec<PendingRun>,
    last_moof_size: usize,
}

impl CmafDemuxer {
    pub fn new() -> Self {
        Self {
            carry: BytesMut::new(),
            tracks: HashMap::new(),
            announced: false,
            video_track: None,
            audio_track: None,
            pending: Vec::new(),
            last_moof_size: 0,
        }
    }

    fn announce(&mut self, sink: &mut dyn SampleSink) -> Result<()> {
        if self.announced {
            return Ok(());
        }
        let video = self
            .video_track
            .and_then(|id| self.tracks.get(&id))
            .map(|t| TrackInfo::video(&t.codec, t.timescale));
        let audio = self
            .audio_track
            .and_then(|id| self.tracks.get(&id))
            .map(|t| TrackInfo::audio(&t.codec, t.sample_rate, t.channels));
        self.announced = true;
        sink.on_codecs(video, audio)
    }

    fn handle_moov(&mut self, body: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        for (tag, content) in boxes(body) {
            if &tag == b"trak" {
                if let Some(track) = parse_trak(content) {
                    let (id, track) = track;
                    if track.is_video && self.video_track.is_none() {
                        self.video_track = Some(id);
                    } else if !track.is_video && self.audio_track.is_none() {
                        self.audio_track = Some(id);
                    }
                    self.tracks.insert(id, track);
                }
            }
        }
        if self.tracks.is_empty() {
            bail!("moov carried no usable tracks");
        }
        self.announce(sink)
    }

    fn handle_moof(&mut self, body: &[u8], moof_size: usize) {
        self.pending.clear();
        self.last_moof_size = moof_size;
        for (tag, traf) in boxes(body) {
            if &tag != b"traf" {
                continue;
            }
            let mut track_id = 0u32;
            let mut default_duration = 0u32;
            let mut default_size = 0u32;
            let mut default_flags = 0u32;
            let mut base_decode_time = 0u64;
            let mut runs = Vec::new();
            for (tag, c) in boxes(traf) {
                match &tag {
                    b"tfhd" => {
                        if c.len() < 8 {
                            continue;
                        }
                        let flags = u32::from_be_bytes([0, c[1], c[2], c[3]]);
                        track_id = u32::from_be_bytes([c[4], c[5], c[6], c[7]]);
                        let mut i = 8;
                        if flags & 0x01 != 0 {
                            i += 8; // base_data_offset
                        }
                        if flags & 0x02 != 0 {
                            i += 4; // sample_description_index
                        }
                        if flags & 0x08 != 0 && c.len() >= i + 4 {
                            default_duration =
                                u32::from_be_bytes(c[i..i + 4].try_into().unwrap());
                            i += 4;
                        }
                        if flags & 0x10 != 0 && c.len() >= i + 4 {
                            default_size = u32::from_be_bytes(c[i..i + 4].try_into().unwrap());
                            i += 4;
                        }
                        if flags & 0x20 != 0 && c.len() >= i + 4 {
                            default_flags = u32::from_be_bytes(c[i..i + 4].try_into().unwrap());
                        }
                    }
                    b"tfdt" => {
                        if c.is_empty() {
                            continue;
                        }
                        base_decode_time = if c[0] == 1 && c.len() >= 12 {
                            u64::from_be_bytes(c[4..12].try_into().unwrap())
                        } else if c.len() >= 8 {
                            u32::from_be_bytes(c[4..8].try_into().unwrap()) as u64
                        } else {
                            0
                        };
                    }
                    b"trun" => {
                        if let Some(run) =
                            parse_trun(c, default_duration, default_size, default_flags)
                        {
                            runs.push(run);
                        }
                    }
                    _ => {}
                }
            }
            for (data_offset, samples) in runs {
                self.pending.push(PendingRun {
                    track_id,
                    base_decode_time,
                    data_offset,
                    samples,
                });
            }
        }
    }

    fn handle_mdat(&mut self, payload: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        let runs = std::mem::take(&mut self.pending);
        // when data offsets are absent, runs are laid out sequentially
        let mut cursor = 0usize;
        for run in runs {
            let Some(track) = self.tracks.get(&run.track_id) else {
                warn!("fragment for unknown track {}", run.track_id);
                continue;
            };
            let mut offset = match run.data_offset {
                // offsets are relative to the start of the moof box
                Some(o) => o.saturating_sub(self.last_moof_size + 8),
                None => cursor,
            };
            let mut decode_time = run.base_decode_time;
            for s in &run.samples {
                let end = offset + s.size as usize;
                if end > payload.len() {
                    warn!("fragment sample out of mdat bounds");
                    break;
                }
                let raw = &payload[offset..end];
                let pts_src = decode_time as i64 + s.cts as i64;
                let pts = rescale(pts_src, track.timescale);
                let dts = rescale(decode_time as i64, track.timescale);
                if track.is_video {
                    let is_key = s.flags & 0x0001_0000 == 0;
                    let mut au = BytesMut::new();
                    let annexb = length_prefixed_to_annexb(raw);
                    if is_key && !codec::contains_parameter_sets(&track.codec, &annexb) {
                        au.extend_from_slice(&track.params.to_annexb());
                    }
                    au.extend_from_slice(&annexb);
                    sink.on_video_sample(pts, dts, au.freeze(), is_key)?;
                } else {
                    sink.on_audio_sample(pts, Bytes::copy_from_slice(raw))?;
                }
                offset = end;
                decode_time += s.duration as u64;
            }
            cursor = offset;
        }
        Ok(())
    }
}

impl Default for CmafDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer for CmafDemuxer {
    fn push(&mut self, data: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        self.carry.extend_from_slice(data);
        loop {
            if self.carry.len() < 8 {
                return Ok(());
            }
            let size = u32::from_be_bytes(self.carry[0..4].try_into().unwrap()) as usize;
            if size < 8 {
                bail!("invalid box size {}", size);
            }
            if self.carry.len() < size {
                return Ok(());
            }
            let full = self.carry.split_to(size);
            let tag: [u8; 4] = full[4..8].try_into().unwrap();
            let body = &full[8..];
            match &tag {
                b"moov" => self.handle_moov(body, sink)?,
                b"moof" => self.handle_moof(body, size),
                b"mdat" => self.handle_mdat(body, sink)?,
                b"ftyp" | b"styp" | b"sidx" | b"prft" | b"emsg" => {
                    trace!("skipping {} box", String::from_utf8_lossy(&tag));
                }
                other => {
                    trace!("ignoring box {}", String::from_utf8_lossy(other));
                }
            }
        }
    }

    fn finish(&mut self, sink: &mut dyn SampleSink) -> Result<()> {
        sink.on_eof()
    }
}

fn rescale(ticks: i64, from: u32) -> i64 {
    if from == 0 || from == RELAY_TIMESCALE {
        return ticks;
    }
    ticks * RELAY_TIMESCALE as i64 / from as i64
}

/// Iterate child boxes of a container body
fn boxes(body: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> {
    let mut i = 0usize;
    std::iter::from_fn(move || {
        if i + 8 > body.len() {
            return None;
        }
        let size = u32::from_be_bytes(body[i..i + 4].try_into().unwrap()) as usize;
        if size < 8 || i + size > body.len() {
            return None;
        }
        let tag: [u8; 4] = body[i + 4..i + 8].try_into().unwrap();
        let content = &body[i + 8..i + size];
        i += size;
        Some((tag, content))
    })
}

fn find_box<'a>(body: &'a [u8], tag: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(body).find(|(t, _)| t == tag).map(|(_, c)| c)
}

fn parse_trak(body: &[u8]) -> Option<(u32, CmafTrack)> {
    let tkhd = find_box(body, b"tkhd")?;
    let version = *tkhd.first()?;
    let track_id = if version == 1 {
        u32::from_be_bytes(tkhd.get(20..24)?.try_into().ok()?)
    } else {
        u32::from_be_bytes(tkhd.get(12..16)?.try_into().ok()?)
    };
    let mdia = find_box(body, b"mdia")?;
    let mdhd = find_box(mdia, b"mdhd")?;
    let timescale = if *mdhd.first()? == 1 {
        u32::from_be_bytes(mdhd.get(20..24)?.try_into().ok()?)
    } else {
        u32::from_be_bytes(mdhd.get(12..16)?.try_into().ok()?)
    };
    let hdlr = find_box(mdia, b"hdlr")?;
    let handler: [u8; 4] = hdlr.get(8..12)?.try_into().ok()?;
    let minf = find_box(mdia, b"minf")?;
    let stbl = find_box(minf, b"stbl")?;
    let stsd = find_box(stbl, b"stsd")?;
    // skip fullbox header + entry_count
    let entries = stsd.get(8..)?;
    let (entry_tag, entry) = boxes(entries).next()?;

    let is_video = &handler == b"vide";
    let mut track = CmafTrack {
        codec: String::new(),
        timescale,
        params: CodecParams::default(),
        sample_rate: 0,
        channels: 0,
        is_video,
    };
    match &entry_tag {
        b"avc1" | b"avc3" => {
            track.codec = "h264".into();
            // visual sample entry is 78 bytes before child boxes
            if let Some(children) = entry.get(78..) {
                if let Some(avcc) = find_box(children, b"avcC") {
                    track.params = parse_avcc(avcc);
                }
            }
        }
        b"hvc1" | b"hev1" => {
            track.codec = "h265".into();
            if let Some(children) = entry.get(78..) {
                if let Some(hvcc) = find_box(children, b"hvcC") {
                    track.params = parse_hvcc(hvcc);
                }
            }
        }
        b"mp4a" => {
            track.codec = "aac".into();
            track.channels = u16::from_be_bytes(entry.get(16..18)?.try_into().ok()?);
            track.sample_rate =
                u32::from_be_bytes(entry.get(24..28)?.try_into().ok()?) >> 16;
        }
        b"ac-3" => {
            track.codec = "ac3".into();
            track.channels = 2;
            track.sample_rate = timescale;
        }
        b"ec-3" => {
            track.codec = "eac3".into();
            track.channels = 2;
            track.sample_rate = timescale;
        }
        _ => return None,
    }
    Some((track_id, track))
}

fn parse_avcc(data: &[u8]) -> CodecParams {
    let mut params = CodecParams::default();
    let Some(&num_sps) = data.get(5) else {
        return params;
    };
    let mut i = 6;
    for _ in 0..(num_sps & 0x1f) {
        let Some(len) = data.get(i..i + 2) else { break };
        let len = u16::from_be_bytes(len.try_into().unwrap()) as usize;
        if let Some(sps) = data.get(i + 2..i + 2 + len) {
            params.sps.push(Bytes::copy_from_slice(sps));
        }
        i += 2 + len;
    }
    let Some(&num_pps) = data.get(i) else {
        return params;
    };
    i += 1;
    for _ in 0..num_pps {
        let Some(len) = data.get(i..i + 2) else { break };
        let len = u16::from_be_bytes(len.try_into().unwrap()) as usize;
        if let Some(pps) = data.get(i + 2..i + 2 + len) {
            params.pps.push(Bytes::copy_from_slice(pps));
        }
        i += 2 + len;
    }
    params
}

fn parse_hvcc(data: &[u8]) -> CodecParams {
    let mut params = CodecParams::default();
    let Some(&num_arrays) = data.get(22) else {
        return params;
    };
    let mut i = 23;
    for _ in 0..num_arrays {
        let Some(&header) = data.get(i) else { break };
        let nal_type = header & 0x3f;
        let Some(count) = data.get(i + 1..i + 3) else { break };
        let count = u16::from_be_bytes(count.try_into().unwrap());
        i += 3;
        for _ in 0..count {
            let Some(len) = data.get(i..i + 2) else { break };
            let len = u16::from_be_bytes(len.try_into().unwrap()) as usize;
            if let Some(nal) = data.get(i + 2..i + 2 + len) {
                let nal = Bytes::copy_from_slice(nal);
                match nal_type {
                    32 => params.vps.push(nal),
                    33 => params.sps.push(nal),
                    34 => params.pps.push(nal),
                    _ => {}
                }
            }
            i += 2 + len;
        }
    }
    params
}

fn parse_trun(
    c: &[u8],
    default_duration: u32,
    default_size: u32,
    default_flags: u32,
) -> Option<(Option<usize>, Vec<TrunSample>)> {
    if c.len() < 8 {
        return None;
    }
    let flags = u32::from_be_bytes([0, c[1], c[2], c[3]]);
    let count = u32::from_be_bytes(c[4..8].try_into().ok()?) as usize;
    let mut i = 8;
    let mut data_offset = None;
    if flags & 0x01 != 0 {
        data_offset = Some(i32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?) as usize);
        i += 4;
    }
    let mut first_sample_flags = None;
    if flags & 0x04 != 0 {
        first_sample_flags = Some(u32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?));
        i += 4;
    }
    let mut samples = Vec::with_capacity(count);
    for n in 0..count {
        let mut s = TrunSample {
            duration: default_duration,
            size: default_size,
            flags: default_flags,
            cts: 0,
        };
        if flags & 0x100 != 0 {
            s.duration = u32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?);
            i += 4;
        }
        if flags & 0x200 != 0 {
            s.size = u32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?);
            i += 4;
        }
        if flags & 0x400 != 0 {
            s.flags = u32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?);
            i += 4;
        }
        if flags & 0x800 != 0 {
            s.cts = i32::from_be_bytes(c.get(i..i + 4)?.try_into().ok()?);
            i += 4;
        }
        if n == 0 {
            if let Some(f) = first_sample_flags {
                s.flags = f;
            }
        }
        samples.push(s);
    }
    Some((data_offset, samples))
}

fn length_prefixed_to_annexb(raw: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(raw.len() + 8);
    let mut i = 0usize;
    while i + 4 <= raw.len() {
        let len = u32::from_be_bytes(raw[i..i + 4].try_into().unwrap()) as usize;
        i += 4;
        if i + len > raw.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&raw[i..i + len]);
        i += len;
    }
    out.freeze()
}
