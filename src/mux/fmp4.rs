use crate::codec::CodecParams;
use crate::error::RelayError;
use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

const MOVIE_TIMESCALE: u32 = 1000;

/// One track entry in an fMP4 init segment
#[derive(Debug, Clone)]
pub struct TrackConfig {
    pub track_id: u32,
    pub codec: String,
    pub timescale: u32,
    /// Parameter sets for video codecs (avcC/hvcC)
    pub params: Option<CodecParams>,
    /// Audio only
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackConfig {
    pub fn video(track_id: u32, codec: &str, params: Option<CodecParams>) -> Self {
        Self {
            track_id,
            codec: codec.to_string(),
            timescale: 90_000,
            params,
            sample_rate: 0,
            channels: 0,
        }
    }

    pub fn audio(track_id: u32, codec: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            track_id,
            codec: codec.to_string(),
            timescale: sample_rate.max(1),
            params: None,
            sample_rate,
            channels,
        }
    }

    fn is_video(&self) -> bool {
        matches!(self.codec.as_str(), "h264" | "h265" | "hevc" | "av1" | "vp9")
    }
}

fn write_box(out: &mut BytesMut, tag: &[u8; 4], body: &[u8]) {
    out.put_u32((body.len() + 8) as u32);
    out.put_slice(tag);
    out.put_slice(body);
}

fn full_box(tag: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> BytesMut {
    let mut b = BytesMut::with_capacity(body.len() + 12);
    b.put_u32((body.len() + 12) as u32);
    b.put_slice(tag);
    b.put_u8(version);
    b.put_slice(&flags.to_be_bytes()[1..]);
    b.put_slice(body);
    b
}

/// ftyp + moov derived from the variant's codec identity
pub struct InitSegment;

impl InitSegment {
    pub fn build(tracks: &[TrackConfig]) -> Result<Bytes> {
        if tracks.is_empty() {
            return Err(RelayError::NoTracksConfigured.into());
        }
        let mut out = BytesMut::new();
        write_box(&mut out, b"ftyp", &{
            let mut b = BytesMut::new();
            b.put_slice(b"iso5");
            b.put_u32(512);
            b.put_slice(b"iso5");
            b.put_slice(b"iso6");
            b.put_slice(b"mp41");
            b
        });

        let mut moov = BytesMut::new();
        moov.put_slice(&mvhd(tracks.iter().map(|t| t.track_id).max().unwrap() + 1));
        for t in tracks {
            moov.put_slice(&trak(t)?);
        }
        // mvex with one trex per track marks the movie as fragmented
        let mut mvex = BytesMut::new();
        for t in tracks {
            let mut body = BytesMut::new();
            body.put_u32(t.track_id);
            body.put_u32(1); // default_sample_description_index
            body.put_u32(0);
            body.put_u32(0);
            body.put_u32(0);
            mvex.put_slice(&full_box(b"trex", 0, 0, &body));
        }
        let mut mvex_box = BytesMut::new();
        write_box(&mut mvex_box, b"mvex", &mvex);
        moov.put_slice(&mvex_box);

        write_box(&mut out, b"moov", &moov);
        Ok(out.freeze())
    }
}

fn mvhd(next_track_id: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(0); // creation
    body.put_u32(0); // modification
    body.put_u32(MOVIE_TIMESCALE);
    body.put_u32(0); // duration, unknown for live
    body.put_u32(0x0001_0000); // rate 1.0
    body.put_u16(0x0100); // volume 1.0
    body.put_u16(0);
    body.put_u64(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        body.put_u32(v);
    }
    body.put_bytes(0, 24); // pre_defined
    body.put_u32(next_track_id);
    full_box(b"mvhd", 0, 0, &body)
}

fn trak(t: &TrackConfig) -> Result<BytesMut> {
    let mut tkhd_body = BytesMut::new();
    tkhd_body.put_u32(0);
    tkhd_body.put_u32(0);
    tkhd_body.put_u32(t.track_id);
    tkhd_body.put_u32(0); // reserved
    tkhd_body.put_u32(0); // duration
    tkhd_body.put_u64(0);
    tkhd_body.put_u16(0); // layer
    tkhd_body.put_u16(0); // alternate_group
    tkhd_body.put_u16(if t.is_video() { 0 } else { 0x0100 }); // volume
    tkhd_body.put_u16(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        tkhd_body.put_u32(v);
    }
    tkhd_body.put_u32(0); // width, unknown at relay level
    tkhd_body.put_u32(0); // height
    let tkhd = full_box(b"tkhd", 0, 0x7, &tkhd_body);

    let mut mdhd_body = BytesMut::new();
    mdhd_body.put_u32(0);
    mdhd_body.put_u32(0);
    mdhd_body.put_u32(t.timescale);
    mdhd_body.put_u32(0);
    mdhd_body.put_u16(0x55c4); // language: und
    mdhd_body.put_u16(0);
    let mdhd = full_box(b"mdhd", 0, 0, &mdhd_body);

    let mut hdlr_body = BytesMut::new();
    hdlr_body.put_u32(0);
    hdlr_body.put_slice(if t.is_video() { b"vide" } else { b"soun" });
    hdlr_body.put_bytes(0, 12);
    hdlr_body.put_slice(if t.is_video() { b"Video\0" } else { b"Audio\0" });
    let hdlr = full_box(b"hdlr", 0, 0, &hdlr_body);

    let header = if t.is_video() {
        let mut b = BytesMut::new();
        b.put_u64(0);
        full_box(b"vmhd", 0, 1, &b)
    } else {
        let mut b = BytesMut::new();
        b.put_u32(0);
        full_box(b"smhd", 0, 0, &b)
    };

    let mut dref_body = BytesMut::new();
    dref_body.put_u32(1);
    dref_body.put_slice(&full_box(b"url ", 0, 1, &[]));
    let dref = full_box(b"dref", 0, 0, &dref_body);
    let mut dinf = BytesMut::new();
    write_box(&mut dinf, b"dinf", &dref);

    let sample_entry = sample_entry(t)?;
    let mut stsd_body = BytesMut::new();
    stsd_body.put_u32(1);
    stsd_body.put_slice(&sample_entry);
    let stsd = full_box(b"stsd", 0, 0, &stsd_body);

    let empty_u32 = 0u32.to_be_bytes();
    let stts = full_box(b"stts", 0, 0, &empty_u32);
    let stsc = full_box(b"stsc", 0, 0, &empty_u32);
    let stsz = {
        let mut b = BytesMut::new();
        b.put_u32(0);
        b.put_u32(0);
        full_box(b"stsz", 0, 0, &b)
    };
    let stco = full_box(b"stco", 0, 0, &empty_u32);

    let mut stbl = BytesMut::new();
    stbl.put_slice(&stsd);
    stbl.put_slice(&stts);
    stbl.put_slice(&stsc);
    stbl.put_slice(&stsz);
    stbl.put_slice(&stco);
    let mut stbl_box = BytesMut::new();
    write_box(&mut stbl_box, b"stbl", &stbl);

    let mut minf = BytesMut::new();
    minf.put_slice(&header);
    minf.put_slice(&dinf);
    minf.put_slice(&stbl_box);
    let mut minf_box = BytesMut::new();
    write_box(&mut minf_box, b"minf", &minf);

    let mut mdia = BytesMut::new();
    mdia.put_slice(&mdhd);
    mdia.put_slice(&hdlr);
    mdia.put_slice(&minf_box);
    let mut mdia_box = BytesMut::new();
    write_box(&mut mdia_box, b"mdia", &mdia);

    let mut trak = BytesMut::new();
    trak.put_slice(&tkhd);
    trak.put_slice(&mdia_box);
    let mut trak_box = BytesMut::new();
    write_box(&mut trak_box, b"trak", &trak);
    Ok(trak_box)
}

fn sample_entry(t: &TrackConfig) -> Result<BytesMut> {
    match t.codec.as_str() {
        "h264" => {
            let params = t
                .params
                .as_ref()
                .filter(|p| !p.sps.is_empty() && !p.pps.is_empty());
            let Some(params) = params else {
                bail!("h264 init segment needs SPS/PPS");
            };
            Ok(visual_entry(b"avc1", b"avcC", &avcc(params)))
        }
        "h265" | "hevc" => {
            let Some(params) = t.params.as_ref().filter(|p| !p.sps.is_empty()) else {
                bail!("hevc init segment needs parameter sets");
            };
            Ok(visual_entry(b"hev1", b"hvcC", &hvcc(params)))
        }
        "aac" => Ok(audio_entry(t)),
        other => bail!("no fMP4 sample entry for codec {:?}", other),
    }
}

fn visual_entry(tag: &[u8; 4], config_tag: &[u8; 4], config: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_bytes(0, 6);
    body.put_u16(1); // data_reference_index
    body.put_bytes(0, 16); // pre_defined / reserved
    body.put_u16(0); // width, carried in the bitstream
    body.put_u16(0); // height
    body.put_u32(0x0048_0000); // horiz dpi
    body.put_u32(0x0048_0000); // vert dpi
    body.put_u32(0);
    body.put_u16(1); // frame_count
    body.put_bytes(0, 32); // compressor name
    body.put_u16(0x0018); // depth
    body.put_i16(-1);
    let mut cfg = BytesMut::new();
    write_box(&mut cfg, config_tag, config);
    body.put_slice(&cfg);
    let mut out = BytesMut::new();
    write_box(&mut out, tag, &body);
    out
}

fn audio_entry(t: &TrackConfig) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_bytes(0, 6);
    body.put_u16(1); // data_reference_index
    body.put_bytes(0, 8);
    body.put_u16(t.channels.max(2));
    body.put_u16(16); // sample size
    body.put_u32(0);
    body.put_u32(t.sample_rate.max(48_000) << 16); // 16.16 fixed
    body.put_slice(&esds(t));
    let mut out = BytesMut::new();
    write_box(&mut out, b"mp4a", &body);
    out
}

fn avcc(params: &CodecParams) -> Vec<u8> {
    let sps = &params.sps[0];
    let mut b = Vec::new();
    b.push(1); // configurationVersion
    b.push(sps.get(1).copied().unwrap_or(0x42)); // profile
    b.push(sps.get(2).copied().unwrap_or(0x00)); // compat
    b.push(sps.get(3).copied().unwrap_or(0x1e)); // level
    b.push(0xfc | 3); // lengthSizeMinusOne = 3
    b.push(0xe0 | params.sps.len() as u8);
    for sps in &params.sps {
        b.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        b.extend_from_slice(sps);
    }
    b.push(params.pps.len() as u8);
    for pps in &params.pps {
        b.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        b.extend_from_slice(pps);
    }
    b
}

fn hvcc(params: &CodecParams) -> Vec<u8> {
    let mut b = Vec::new();
    b.push(1); // configurationVersion
    // profile/tier/level left at conservative defaults; players read the
    // in-band parameter sets carried in the arrays below
    b.push(0x01);
    b.extend_from_slice(&[0x60, 0, 0, 0]); // compatibility flags
    b.extend_from_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint flags
    b.push(0x5d); // level
    b.extend_from_slice(&[0xf0, 0x00]); // spatial segmentation
    b.push(0xfc); // parallelism
    b.push(0xfd); // chroma 4:2:0
    b.push(0xf8); // bit depth luma - 8
    b.push(0xf8); // bit depth chroma - 8
    b.extend_from_slice(&[0, 0]); // avg frame rate
    b.push(0x0f); // lengthSizeMinusOne = 3, numTemporalLayers 1
    let arrays: [(&u8, &Vec<Bytes>); 3] = [
        (&0x20, &params.vps),
        (&0x21, &params.sps),
        (&0x22, &params.pps),
    ];
    let present: Vec<_> = arrays.iter().filter(|(_, v)| !v.is_empty()).collect();
    b.push(present.len() as u8);
    for (nal_type, nals) in present {
        b.push(0x80 | **nal_type); // array_completeness
        b.extend_from_slice(&(nals.len() as u16).to_be_bytes());
        for nal in nals.iter() {
            b.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            b.extend_from_slice(nal);
        }
    }
    b
}

fn esds(t: &TrackConfig) -> BytesMut {
    let freq_index = match t.sample_rate {
        96_000 => 0u8,
        88_200 => 1,
        64_000 => 2,
        48_000 | 0 => 3,
        44_100 => 4,
        32_000 => 5,
        24_000 => 6,
        22_050 => 7,
        16_000 => 8,
        12_000 => 9,
        11_025 => 10,
        8_000 => 11,
        _ => 3,
    };
    let channels = t.channels.clamp(1, 7) as u8;
    // AudioSpecificConfig: AAC-LC (2)
    let asc = [
        (2u8 << 3) | (freq_index >> 1),
        ((freq_index & 1) << 7) | (channels << 3),
    ];

    let mut dec_specific = vec![0x05, asc.len() as u8];
    dec_specific.extend_from_slice(&asc);

    let mut dec_config = vec![0x04, (13 + dec_specific.len()) as u8];
    dec_config.push(0x40); // objectTypeIndication: MPEG-4 audio
    dec_config.push(0x15); // streamType audio
    dec_config.extend_from_slice(&[0, 0, 0]); // buffer size
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // max bitrate
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // avg bitrate
    dec_config.extend_from_slice(&dec_specific);

    let mut es = vec![0x03, (3 + dec_config.len() + 3) as u8];
    es.extend_from_slice(&[0, 1, 0]); // ES_ID, flags
    es.extend_from_slice(&dec_config);
    es.extend_from_slice(&[0x06, 0x01, 0x02]); // SLConfig

    full_box(b"esds", 0, 0, &es)
}

/// One sample row in a trun
#[derive(Debug, Clone)]
pub struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub cts_offset: i32,
    pub is_keyframe: bool,
}

/// One track's slice of a fragment
pub struct FragmentTrack {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub samples: Vec<FragmentSample>,
    pub data: Bytes,
}

/// Writes moof+mdat pairs with a monotonic fragment sequence
pub struct FragmentWriter {
    sequence: u32,
}

impl FragmentWriter {
    pub fn new() -> Self {
        Self { sequence: 1 }
    }

    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn write_fragment(&mut self, tracks: &[FragmentTrack]) -> Result<Bytes> {
        if tracks.is_empty() {
            return Err(RelayError::NoTracksConfigured.into());
        }
        const MFHD_SIZE: usize = 16;
        const TFHD_SIZE: usize = 16;
        const TFDT_SIZE: usize = 20;
        let trun_size = |n: usize| 20 + 16 * n;
        let traf_size = |n: usize| 8 + TFHD_SIZE + TFDT_SIZE + trun_size(n);

        let moof_size: usize = 8
            + MFHD_SIZE
            + tracks
                .iter()
                .map(|t| traf_size(t.samples.len()))
                .sum::<usize>();

        let mut moof = BytesMut::with_capacity(moof_size);
        let mut mfhd_body = BytesMut::new();
        mfhd_body.put_u32(self.sequence);
        let mfhd = full_box(b"mfhd", 0, 0, &mfhd_body);

        let mut trafs = BytesMut::new();
        let mut data_offset = moof_size + 8; // into the mdat payload
        for t in tracks {
            let mut tfhd_body = BytesMut::new();
            tfhd_body.put_u32(t.track_id);
            let tfhd = full_box(b"tfhd", 0, 0x020000, &tfhd_body); // default-base-is-moof

            let mut tfdt_body = BytesMut::new();
            tfdt_body.put_u64(t.base_decode_time);
            let tfdt = full_box(b"tfdt", 1, 0, &tfdt_body);

            let mut trun_body = BytesMut::new();
            trun_body.put_u32(t.samples.len() as u32);
            trun_body.put_i32(data_offset as i32);
            for s in &t.samples {
                trun_body.put_u32(s.duration);
                trun_body.put_u32(s.size);
                let flags: u32 = if s.is_keyframe {
                    0x0200_0000 // depends_on: no
                } else {
                    0x0101_0000 // depends_on: yes, non-sync
                };
                trun_body.put_u32(flags);
                trun_body.put_i32(s.cts_offset);
            }
            // data-offset | duration | size | flags | cts
            let trun = full_box(b"trun", 0, 0x000f01, &trun_body);

            let mut traf = BytesMut::new();
            traf.put_slice(&tfhd);
            traf.put_slice(&tfdt);
            traf.put_slice(&trun);
            let mut traf_box = BytesMut::new();
            write_box(&mut traf_box, b"traf", &traf);
            debug_assert_eq!(traf_box.len(), traf_size(t.samples.len()));
            trafs.put_slice(&traf_box);

            data_offset += t.data.len();
        }

        let mut moof_body = BytesMut::new();
        moof_body.put_slice(&mfhd);
        moof_body.put_slice(&trafs);
        write_box(&mut moof, b"moof", &moof_body);
        debug_assert_eq!(moof.len(), moof_size);

        let total_data: usize = tracks.iter().map(|t| t.data.len()).sum();
        let mut out = BytesMut::with_capacity(moof.len() + 8 + total_data);
        out.put_slice(&moof);
        out.put_u32((8 + total_data) as u32);
        out.put_slice(b"mdat");
        for t in tracks {
            out.put_slice(&t.data);
        }
        self.sequence += 1;
        Ok(out.freeze())
    }
}

impl Default for FragmentWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn h264_params() -> CodecParams {
        CodecParams {
            vps: vec![],
            sps: vec![Bytes::from_static(&[0x67, 0x64, 0x00, 0x1e, 0xac])],
            pps: vec![Bytes::from_static(&[0x68, 0xeb, 0xe3, 0xcb])],
        }
    }

    #[test]
    fn test_zero_track_init_fails() {
        let err = InitSegment::build(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NoTracksConfigured)
        ));
    }

    #[test]
    fn test_init_segment_structure() {
        let tracks = [
            TrackConfig::video(1, "h264", Some(h264_params())),
            TrackConfig::audio(2, "aac", 48_000, 2),
        ];
        let init = InitSegment::build(&tracks).unwrap();
        assert_eq!(&init[4..8], b"ftyp");
        // moov follows ftyp
        let ftyp_len = u32::from_be_bytes(init[0..4].try_into().unwrap()) as usize;
        assert_eq!(&init[ftyp_len + 4..ftyp_len + 8], b"moov");
    }

    #[test]
    fn test_video_init_requires_params() {
        let tracks = [TrackConfig::video(1, "h264", None)];
        assert!(InitSegment::build(&tracks).is_err());
    }

    #[test]
    fn test_fragment_layout_and_sequencing() {
        let mut w = FragmentWriter::new();
        let data = Bytes::from_static(&[0, 0, 0, 2, 0x65, 0xaa]);
        let frag = w
            .write_fragment(&[FragmentTrack {
                track_id: 1,
                base_decode_time: 0,
                samples: vec![FragmentSample {
                    duration: 3000,
                    size: data.len() as u32,
                    cts_offset: 0,
                    is_keyframe: true,
                }],
                data: data.clone(),
            }])
            .unwrap();
        assert_eq!(&frag[4..8], b"moof");
        let moof_len = u32::from_be_bytes(frag[0..4].try_into().unwrap()) as usize;
        assert_eq!(&frag[moof_len + 4..moof_len + 8], b"mdat");
        assert_eq!(&frag[moof_len + 8..], &data[..]);
        assert_eq!(w.next_sequence(), 2);
    }

    #[test]
    fn test_fragment_data_offset_points_at_mdat_payload() {
        let mut w = FragmentWriter::new();
        let v = Bytes::from_static(&[1, 2, 3, 4]);
        let a = Bytes::from_static(&[5, 6]);
        let frag = w
            .write_fragment(&[
                FragmentTrack {
                    track_id: 1,
                    base_decode_time: 100,
                    samples: vec![FragmentSample {
                        duration: 3000,
                        size: 4,
                        cts_offset: 0,
                        is_keyframe: true,
                    }],
                    data: v,
                },
                FragmentTrack {
                    track_id: 2,
                    base_decode_time: 200,
                    samples: vec![FragmentSample {
                        duration: 1024,
                        size: 2,
                        cts_offset: 0,
                        is_keyframe: false,
                    }],
                    data: a,
                },
            ])
            .unwrap();
        let moof_len = u32::from_be_bytes(frag[0..4].try_into().unwrap()) as usize;
        // first track payload begins immediately after the mdat header
        assert_eq!(&frag[moof_len + 8..moof_len + 12], &[1, 2, 3, 4]);
        assert_eq!(&frag[moof_len + 12..moof_len + 14], &[5, 6]);
    }

    #[test]
    fn test_empty_fragment_rejected() {
        let mut w = FragmentWriter::new();
        assert!(w.write_fragment(&[]).is_err());
    }
}
