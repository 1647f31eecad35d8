use crate::codec;
use crate::demux::{Demuxer, SampleSink, TrackInfo};
use crate::mux::mpegts::TS_PACKET_SIZE;
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{trace, warn};

fn codec_for_stream_type(stream_type: u8) -> Option<&'static str> {
    Some(match stream_type {
        0x1b => "h264",
        0x24 => "h265",
        0x02 => "mpeg2",
        0x0f => "aac",
        0x03 | 0x04 => "mp3",
        0x81 => "ac3",
        0x87 => "eac3",
        0x06 => "opus",
        _ => return None,
    })
}

fn is_video_codec(codec: &str) -> bool {
    matches!(codec, "h264" | "h265" | "mpeg2")
}

struct PesAssembler {
    codec: &'static str,
    buf: BytesMut,
    pts: Option<i64>,
    dts: Option<i64>,
    random_access: bool,
}

/// Incremental MPEG-TS parser: PAT -> PMT -> PES assembly -> samples.
///
/// One access unit is emitted per PES packet; keyframes are detected by NAL
/// inspection with the adaptation-field random-access bit as a hint.
pub struct TsDemuxer {
    carry: BytesMut,
    pmt_pid: Option<u16>,
    streams: HashMap<u16, PesAssembler>,
    announced: bool,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            carry: BytesMut::new(),
            pmt_pid: None,
            streams: HashMap::new(),
            announced: false,
        }
    }

    fn handle_packet(&mut self, pkt: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        if pkt[0] != 0x47 {
            bail!("lost TS sync");
        }
        let pusi = pkt[1] & 0x40 != 0;
        let pid = u16::from_be_bytes([pkt[1] & 0x1f, pkt[2]]);
        let afc = (pkt[3] >> 4) & 0x3;
        let mut offset = 4;
        let mut random_access = false;
        if afc & 0x2 != 0 {
            let af_len = pkt[4] as usize;
            if af_len > 0 && pkt.len() > 5 {
                random_access = pkt[5] & 0x40 != 0;
            }
            offset += 1 + af_len;
        }
        if afc & 0x1 == 0 || offset >= pkt.len() {
            return Ok(());
        }
        let payload = &pkt[offset..];

        if pid == 0 {
            self.parse_pat(payload);
            return Ok(());
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload, sink)?;
            return Ok(());
        }

        if pusi {
            self.flush_pid(pid, sink)?;
        }
        if let Some(asm) = self.streams.get_mut(&pid) {
            if pusi {
                let Some((pts, dts, data)) = parse_pes_header(payload) else {
                    warn!("malformed PES header on pid {}", pid);
                    return Ok(());
                };
                asm.pts = pts;
                asm.dts = dts.or(pts);
                asm.random_access = random_access;
                asm.buf.extend_from_slice(data);
            } else if !asm.buf.is_empty() || asm.pts.is_some() {
                asm.buf.extend_from_slice(payload);
            }
        }
        Ok(())
    }

    fn psi_section(payload: &[u8]) -> Option<&[u8]> {
        let pointer = *payload.first()? as usize;
        payload.get(1 + pointer..)
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(section) = Self::psi_section(payload) else {
            return;
        };
        if section.len() < 13 || section[0] != 0x00 {
            return;
        }
        let section_len = (u16::from_be_bytes([section[1] & 0x0f, section[2]])) as usize;
        let end = (3 + section_len).min(section.len());
        // program loop starts after the 5-byte header, CRC trails
        let mut i = 8;
        while i + 4 <= end.saturating_sub(4) {
            let program = u16::from_be_bytes([section[i], section[i + 1]]);
            let pid = u16::from_be_bytes([section[i + 2] & 0x1f, section[i + 3]]);
            if program != 0 {
                self.pmt_pid = Some(pid);
            }
            i += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        if self.announced {
            return Ok(());
        }
        let Some(section) = Self::psi_section(payload) else {
            return Ok(());
        };
        if section.len() < 16 || section[0] != 0x02 {
            return Ok(());
        }
        let section_len = (u16::from_be_bytes([section[1] & 0x0f, section[2]])) as usize;
        let end = (3 + section_len).min(section.len()).saturating_sub(4);
        let program_info_len =
            (u16::from_be_bytes([section[10] & 0x0f, section[11]])) as usize;
        let mut i = 12 + program_info_len;
        let mut video: Option<(u16, &'static str)> = None;
        let mut audio: Option<(u16, &'static str)> = None;
        while i + 5 <= end {
            let stream_type = section[i];
            let pid = u16::from_be_bytes([section[i + 1] & 0x1f, section[i + 2]]);
            let es_info_len = (u16::from_be_bytes([section[i + 3] & 0x0f, section[i + 4]])) as usize;
            i += 5 + es_info_len;
            let Some(codec) = codec_for_stream_type(stream_type) else {
                trace!("ignoring unknown stream_type {:#x} pid {}", stream_type, pid);
                continue;
            };
            if is_video_codec(codec) && video.is_none() {
                video = Some((pid, codec));
            } else if !is_video_codec(codec) && audio.is_none() {
                audio = Some((pid, codec));
            }
        }

        for (pid, codec) in video.iter().chain(audio.iter()) {
            self.streams.insert(
                *pid,
                PesAssembler {
                    codec,
                    buf: BytesMut::new(),
                    pts: None,
                    dts: None,
                    random_access: false,
                },
            );
        }
        self.announced = true;
        sink.on_codecs(
            video.map(|(_, c)| TrackInfo::video(c, 90_000)),
            // channel layout is not visible at TS level without ADTS parsing;
            // assume the common stereo/48k until samples say otherwise
            audio.map(|(_, c)| TrackInfo::audio(c, 48_000, 2)),
        )
    }

    fn flush_pid(&mut self, pid: u16, sink: &mut dyn SampleSink) -> Result<()> {
        let Some(asm) = self.streams.get_mut(&pid) else {
            return Ok(());
        };
        if asm.buf.is_empty() {
            return Ok(());
        }
        let Some(pts) = asm.pts else {
            asm.buf.clear();
            return Ok(());
        };
        let data: Bytes = asm.buf.split().freeze();
        let dts = asm.dts.unwrap_or(pts);
        if is_video_codec(asm.codec) {
            let key = codec::is_keyframe(asm.codec, &data) || asm.random_access;
            sink.on_video_sample(pts, dts, data, key)?;
        } else {
            sink.on_audio_sample(pts, data)?;
        }
        asm.pts = None;
        asm.dts = None;
        asm.random_access = false;
        Ok(())
    }

    fn flush_all(&mut self, sink: &mut dyn SampleSink) -> Result<()> {
        let pids: Vec<u16> = self.streams.keys().copied().collect();
        for pid in pids {
            self.flush_pid(pid, sink)?;
        }
        Ok(())
    }
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer for TsDemuxer {
    fn push(&mut self, data: &[u8], sink: &mut dyn SampleSink) -> Result<()> {
        self.carry.extend_from_slice(data);
        // resync if the carry does not start on a sync byte
        while !self.carry.is_empty() && self.carry[0] != 0x47 {
            let pos = self.carry.iter().position(|&b| b == 0x47);
            match pos {
                Some(p) => {
                    let _ = self.carry.split_to(p);
                }
                None => {
                    self.carry.clear();
                    return Ok(());
                }
            }
        }
        while self.carry.len() >= TS_PACKET_SIZE {
            let pkt = self.carry.split_to(TS_PACKET_SIZE);
            self.handle_packet(&pkt, sink)?;
        }
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn SampleSink) -> Result<()> {
        self.flush_all(sink)?;
        sink.on_eof()
    }
}

/// Returns (pts, dts, elementary payload) from a PES packet
fn parse_pes_header(data: &[u8]) -> Option<(Option<i64>, Option<i64>, &[u8])> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return None;
    }
    let flags2 = data[7];
    let header_len = data[8] as usize;
    let body = data.get(9 + header_len..)?;
    let mut pts = None;
    let mut dts = None;
    if flags2 & 0x80 != 0 && data.len() >= 14 {
        pts = Some(read_timestamp(&data[9..14]));
        if flags2 & 0x40 != 0 && data.len() >= 19 {
            dts = Some(read_timestamp(&data[14..19]));
        }
    }
    Some((pts, dts, body))
}

fn read_timestamp(b: &[u8]) -> i64 {
    (((b[0] as i64 >> 1) & 0x07) << 30)
        | ((b[1] as i64) << 22)
        | (((b[2] as i64 >> 1) & 0x7f) << 15)
        | ((b[3] as i64) << 7)
        | ((b[4] as i64 >> 1) & 0x7f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::testing::CollectSink;
    use crate::mux::TsMuxer;

    fn keyframe_au() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1e]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xeb]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xaa, 0xbb, 0xcc]);
        v
    }

    fn delta_au(n: u8) -> Vec<u8> {
        vec![0, 0, 0, 1, 0x41, n, n, n]
    }

    #[test]
    fn test_roundtrip_preserves_keyframes_and_pts() {
        let mut mux = TsMuxer::new(Some("h264"), Some("aac")).unwrap();
        mux.write_psi();
        let mut expected_key_pts = Vec::new();
        for i in 0..30i64 {
            let pts = i * 3003;
            if i % 10 == 0 {
                mux.write_video(pts, pts, &keyframe_au(), true).unwrap();
                expected_key_pts.push(pts);
            } else {
                mux.write_video(pts, pts, &delta_au(i as u8), false).unwrap();
            }
            if i % 3 == 0 {
                mux.write_audio(pts, &[0xff, 0xf1, 0x01, 0x02]).unwrap();
            }
        }
        let ts = mux.take();

        let mut demux = TsDemuxer::new();
        let mut sink = CollectSink::default();
        // feed in uneven chunks to exercise reassembly
        for chunk in ts.chunks(411) {
            demux.push(chunk, &mut sink).unwrap();
        }
        demux.finish(&mut sink).unwrap();

        assert!(sink.eof);
        assert_eq!(sink.video.as_ref().unwrap().codec, "h264");
        assert_eq!(sink.audio.as_ref().unwrap().codec, "aac");
        assert_eq!(sink.video_samples.len(), 30);
        let key_pts: Vec<i64> = sink
            .video_samples
            .iter()
            .filter(|(_, _, _, key)| *key)
            .map(|(pts, _, _, _)| *pts)
            .collect();
        assert_eq!(key_pts, expected_key_pts);
        assert_eq!(sink.audio_samples.len(), 10);
    }

    #[test]
    fn test_resync_after_garbage_prefix() {
        let mut mux = TsMuxer::new(Some("h264"), None).unwrap();
        mux.write_psi();
        mux.write_video(0, 0, &keyframe_au(), true).unwrap();
        mux.write_video(3000, 3000, &delta_au(1), false).unwrap();
        let ts = mux.take();

        let mut garbled = vec![0xde, 0xad, 0xbe, 0xef];
        garbled.extend_from_slice(&ts);

        let mut demux = TsDemuxer::new();
        let mut sink = CollectSink::default();
        demux.push(&garbled, &mut sink).unwrap();
        demux.finish(&mut sink).unwrap();
        assert_eq!(sink.video_samples.len(), 2);
        assert!(sink.video_samples[0].3);
    }

    #[test]
    fn test_video_only_stream() {
        let mut mux = TsMuxer::new(Some("h265"), None).unwrap();
        mux.write_psi();
        // hevc IDR_W_RADL nal type 19
        let au = [0u8, 0, 0, 1, 19 << 1, 0x01, 0xaa];
        mux.write_video(0, 0, &au, true).unwrap();
        let ts = mux.take();

        let mut demux = TsDemuxer::new();
        let mut sink = CollectSink::default();
        demux.push(&ts, &mut sink).unwrap();
        demux.finish(&mut sink).unwrap();
        assert_eq!(sink.video.as_ref().unwrap().codec, "h265");
        assert!(sink.audio.is_none());
        assert_eq!(sink.video_samples.len(), 1);
    }
}
