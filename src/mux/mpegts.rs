use crate::mux::crc32_mpeg;
use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const TS_PACKET_SIZE: usize = 188;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

const STREAM_ID_VIDEO: u8 = 0xe0;
const STREAM_ID_AUDIO: u8 = 0xc0;

/// ISO 13818-1 stream_type for the codecs the relay carries
pub fn stream_type_for(codec: &str) -> Result<u8> {
    Ok(match codec {
        "h264" => 0x1b,
        "h265" | "hevc" => 0x24,
        "aac" => 0x0f,
        "mp3" => 0x03,
        "ac3" => 0x81,
        "eac3" => 0x87,
        "opus" => 0x06,
        "mpeg2" => 0x02,
        _ => bail!("no TS stream type for codec {:?}", codec),
    })
}

struct TsTrack {
    pid: u16,
    stream_id: u8,
    stream_type: u8,
}

/// Persistent in-memory MPEG-TS muxer.
///
/// Output accumulates in an internal buffer drained with [TsMuxer::take];
/// continuity counters persist across segment boundaries so the byte stream
/// stays valid when segments are concatenated, while [TsMuxer::write_psi]
/// lets each segment open with fresh PAT/PMT so it is independently
/// decodable.
pub struct TsMuxer {
    video: Option<TsTrack>,
    audio: Option<TsTrack>,
    continuity: [u8; 8192],
    out: BytesMut,
}

impl TsMuxer {
    pub fn new(video_codec: Option<&str>, audio_codec: Option<&str>) -> Result<Self> {
        let video = match video_codec {
            Some(c) if !c.is_empty() => Some(TsTrack {
                pid: PID_VIDEO,
                stream_id: STREAM_ID_VIDEO,
                stream_type: stream_type_for(c)?,
            }),
            _ => None,
        };
        let audio = match audio_codec {
            Some(c) if !c.is_empty() => Some(TsTrack {
                pid: PID_AUDIO,
                stream_id: STREAM_ID_AUDIO,
                stream_type: stream_type_for(c)?,
            }),
            _ => None,
        };
        if video.is_none() && audio.is_none() {
            bail!("TS muxer needs at least one track");
        }
        Ok(Self {
            video,
            audio,
            continuity: [0; 8192],
            out: BytesMut::new(),
        })
    }

    /// The PID carrying the PCR (video when present)
    fn pcr_pid(&self) -> u16 {
        self.video
            .as_ref()
            .map(|t| t.pid)
            .or(self.audio.as_ref().map(|t| t.pid))
            .unwrap()
    }

    /// Emit PAT + PMT. Call at the start of the stream and of every segment.
    pub fn write_psi(&mut self) {
        let pat = self.build_pat();
        let pmt = self.build_pmt();
        self.write_section(PID_PAT, &pat);
        self.write_section(PID_PMT, &pmt);
    }

    pub fn write_video(&mut self, pts: i64, dts: i64, data: &[u8], is_keyframe: bool) -> Result<()> {
        let Some(track) = &self.video else {
            bail!("muxer has no video track");
        };
        let pid = track.pid;
        let stream_id = track.stream_id;
        let pes = build_pes(stream_id, Some(pts), Some(dts), data, 0);
        let pcr = is_keyframe.then_some(dts.max(0) as u64 * 300);
        self.packetize(pid, &pes, is_keyframe, pcr);
        Ok(())
    }

    pub fn write_audio(&mut self, pts: i64, data: &[u8]) -> Result<()> {
        let Some(track) = &self.audio else {
            bail!("muxer has no audio track");
        };
        let pid = track.pid;
        let stream_id = track.stream_id;
        let pes_len = 3 + 5 + data.len();
        let pes = build_pes(stream_id, Some(pts), None, data, pes_len as u16);
        self.packetize(pid, &pes, false, None);
        Ok(())
    }

    /// Drain everything muxed so far
    pub fn take(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    pub fn buffered_len(&self) -> usize {
        self.out.len()
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity[pid as usize];
        self.continuity[pid as usize] = (cc + 1) & 0x0f;
        cc
    }

    fn build_pat(&self) -> Vec<u8> {
        let mut section = Vec::new();
        section.push(0x00); // table_id
        // section_syntax + length filled below
        let body: Vec<u8> = {
            let mut b = Vec::new();
            b.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
            b.push(0xc1); // version 0, current_next
            b.push(0x00); // section_number
            b.push(0x00); // last_section_number
            b.extend_from_slice(&[0x00, 0x01]); // program_number 1
            b.extend_from_slice(&(0xe000 | PID_PMT).to_be_bytes());
            b
        };
        let len = (body.len() + 4) as u16; // + CRC
        section.extend_from_slice(&(0xb000 | len).to_be_bytes());
        section.extend_from_slice(&body);
        let crc = crc32_mpeg(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn build_pmt(&self) -> Vec<u8> {
        let mut section = Vec::new();
        section.push(0x02); // table_id
        let body: Vec<u8> = {
            let mut b = Vec::new();
            b.extend_from_slice(&[0x00, 0x01]); // program_number
            b.push(0xc1);
            b.push(0x00);
            b.push(0x00);
            b.extend_from_slice(&(0xe000 | self.pcr_pid()).to_be_bytes());
            b.extend_from_slice(&[0xf0, 0x00]); // program_info_length 0
            for track in self.video.iter().chain(self.audio.iter()) {
                b.push(track.stream_type);
                b.extend_from_slice(&(0xe000 | track.pid).to_be_bytes());
                b.extend_from_slice(&[0xf0, 0x00]); // ES_info_length 0
            }
            b
        };
        let len = (body.len() + 4) as u16;
        section.extend_from_slice(&(0xb000 | len).to_be_bytes());
        section.extend_from_slice(&body);
        let crc = crc32_mpeg(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    /// One PSI section in a single TS packet (pointer_field + stuffing)
    fn write_section(&mut self, pid: u16, section: &[u8]) {
        let cc = self.next_cc(pid);
        let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
        pkt.put_u8(0x47);
        pkt.put_u16(0x4000 | pid); // PUSI set
        pkt.put_u8(0x10 | cc); // payload only
        pkt.put_u8(0x00); // pointer_field
        pkt.put_slice(section);
        while pkt.len() < TS_PACKET_SIZE {
            pkt.put_u8(0xff);
        }
        self.out.put_slice(&pkt);
    }

    /// Split a PES packet across TS packets, stuffing the final one through
    /// the adaptation field
    fn packetize(&mut self, pid: u16, pes: &[u8], random_access: bool, pcr: Option<u64>) {
        let mut remaining = pes;
        let mut first = true;
        while !remaining.is_empty() {
            let cc = self.next_cc(pid);
            let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
            pkt.put_u8(0x47);
            let pusi = if first { 0x4000 } else { 0 };
            pkt.put_u16(pusi | pid);

            // adaptation field body (without its length byte)
            let mut af = BytesMut::new();
            if first && (pcr.is_some() || random_access) {
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                af.put_u8(flags);
                if let Some(pcr) = pcr {
                    let base = pcr / 300;
                    let ext = pcr % 300;
                    af.put_u8((base >> 25) as u8);
                    af.put_u8((base >> 17) as u8);
                    af.put_u8((base >> 9) as u8);
                    af.put_u8((base >> 1) as u8);
                    af.put_u8(((base << 7) as u8 & 0x80) | 0x7e | ((ext >> 8) as u8 & 1));
                    af.put_u8(ext as u8);
                }
            }

            let mut has_af = !af.is_empty();
            let mut capacity = if has_af { 183 - af.len() } else { 184 };

            if remaining.len() < capacity {
                // stuff through the adaptation field so the packet is full
                if !has_af {
                    has_af = true;
                    let deficit = 183 - remaining.len();
                    if deficit > 0 {
                        af.put_u8(0x00);
                        for _ in 1..deficit {
                            af.put_u8(0xff);
                        }
                    }
                } else {
                    for _ in 0..(capacity - remaining.len()) {
                        af.put_u8(0xff);
                    }
                }
                capacity = 183 - af.len();
            }

            let afc = if has_af { 0x30 } else { 0x10 };
            pkt.put_u8(afc | cc);
            if has_af {
                pkt.put_u8(af.len() as u8);
                pkt.put_slice(&af);
            }
            let take = remaining.len().min(capacity);
            pkt.put_slice(&remaining[..take]);
            remaining = &remaining[take..];
            first = false;
            debug_assert_eq!(pkt.len(), TS_PACKET_SIZE);
            self.out.put_slice(&pkt);
        }
    }
}

/// Build a PES packet with PTS (and optionally DTS)
fn build_pes(stream_id: u8, pts: Option<i64>, dts: Option<i64>, data: &[u8], pes_len: u16) -> Vec<u8> {
    let mut pes = Vec::with_capacity(data.len() + 19);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    pes.extend_from_slice(&pes_len.to_be_bytes());
    let mut flags2 = 0u8;
    let mut header_len = 0u8;
    if pts.is_some() {
        flags2 |= 0x80;
        header_len += 5;
    }
    if dts.is_some() && dts != pts {
        flags2 |= 0x40;
        header_len += 5;
    }
    pes.push(0x80); // marker bits
    pes.push(flags2);
    pes.push(header_len);
    if let Some(pts) = pts {
        let marker = if flags2 & 0x40 != 0 { 0x30 } else { 0x20 };
        put_timestamp(&mut pes, marker, pts);
    }
    if flags2 & 0x40 != 0 {
        put_timestamp(&mut pes, 0x10, dts.unwrap());
    }
    pes.extend_from_slice(data);
    pes
}

fn put_timestamp(out: &mut Vec<u8>, marker: u8, ts: i64) {
    let ts = (ts as u64) & 0x1_ffff_ffff;
    out.push(marker | ((ts >> 29) as u8 & 0x0e) | 0x01);
    out.push((ts >> 22) as u8);
    out.push(((ts >> 14) as u8 & 0xfe) | 0x01);
    out.push((ts >> 7) as u8);
    out.push(((ts << 1) as u8 & 0xfe) | 0x01);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_packet_aligned() {
        let mut mux = TsMuxer::new(Some("h264"), Some("aac")).unwrap();
        mux.write_psi();
        mux.write_video(0, 0, &[0, 0, 0, 1, 0x65, 0xaa, 0xbb], true)
            .unwrap();
        mux.write_audio(0, &[0xff, 0xf1, 0x50, 0x80, 0x01, 0x00]).unwrap();
        let out = mux.take();
        assert!(!out.is_empty());
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for chunk in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], 0x47, "sync byte on every packet");
        }
    }

    #[test]
    fn test_large_payload_spans_packets() {
        let mut mux = TsMuxer::new(Some("h264"), None).unwrap();
        let payload = vec![0xab; 10_000];
        mux.write_video(90_000, 90_000, &payload, false).unwrap();
        let out = mux.take();
        assert!(out.len() > 10_000);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
    }

    #[test]
    fn test_no_tracks_rejected() {
        assert!(TsMuxer::new(None, None).is_err());
        assert!(TsMuxer::new(Some(""), Some("")).is_err());
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut mux = TsMuxer::new(Some("h264"), None).unwrap();
        for i in 0..5 {
            mux.write_video(i * 3000, i * 3000, &[0, 0, 0, 1, 0x41, 0x01], false)
                .unwrap();
        }
        let out = mux.take();
        let mut last_cc: Option<u8> = None;
        for chunk in out.chunks(TS_PACKET_SIZE) {
            let pid = u16::from_be_bytes([chunk[1] & 0x1f, chunk[2]]);
            if pid != PID_VIDEO {
                continue;
            }
            let cc = chunk[3] & 0x0f;
            if let Some(prev) = last_cc {
                assert_eq!(cc, (prev + 1) & 0x0f);
            }
            last_cc = Some(cc);
        }
        assert!(last_cc.is_some());
    }

    #[test]
    fn test_take_drains() {
        let mut mux = TsMuxer::new(Some("h264"), None).unwrap();
        mux.write_psi();
        assert!(mux.buffered_len() > 0);
        let _ = mux.take();
        assert_eq!(mux.buffered_len(), 0);
    }
}
