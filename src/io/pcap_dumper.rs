use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

use super::IoError;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION: (u16, u16) = (2, 4);
const SNAPLEN: u32 = 65535;
const LINKTYPE_ETHERNET: u32 = 1;

/// 经典 libpcap 格式的抓包文件，按本机字节序写
pub struct PcapDumper<W: Write = BufWriter<File>> {
    out: W,
}

impl PcapDumper {
    pub fn create(path: &Path) -> Result<Self, IoError> {
        let wrap = |source| IoError::Dump {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(wrap)?;
        PcapDumper::new(BufWriter::new(file)).map_err(wrap)
    }
}

impl<W: Write> PcapDumper<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&PCAP_MAGIC.to_ne_bytes())?;
        out.write_all(&PCAP_VERSION.0.to_ne_bytes())?;
        out.write_all(&PCAP_VERSION.1.to_ne_bytes())?;
        out.write_all(&0i32.to_ne_bytes())?; // thiszone
        out.write_all(&0u32.to_ne_bytes())?; // sigfigs
        out.write_all(&SNAPLEN.to_ne_bytes())?;
        out.write_all(&LINKTYPE_ETHERNET.to_ne_bytes())?;
        Ok(Self { out })
    }

    pub fn dump(&mut self, frame: &[u8]) -> io::Result<()> {
        self.dump_at(Utc::now(), frame)
    }

    pub fn dump_at(&mut self, at: DateTime<Utc>, frame: &[u8]) -> io::Result<()> {
        let caplen = frame.len().min(SNAPLEN as usize);
        self.out.write_all(&(at.timestamp() as u32).to_ne_bytes())?;
        self.out.write_all(&at.timestamp_subsec_micros().to_ne_bytes())?;
        self.out.write_all(&(caplen as u32).to_ne_bytes())?;
        self.out.write_all(&(frame.len() as u32).to_ne_bytes())?;
        self.out.write_all(&frame[..caplen])
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
