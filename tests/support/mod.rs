//! In-memory devices that answer the wire protocols like real hardware.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use vex_serial::crc::crc32;
use vex_serial::devices::stm32::{ACK as STM32_ACK, FLASH_START, NACK as STM32_NACK};
use vex_serial::io::ByteChannel;
use vex_serial::protocol::extended::{encode_extended_response, parse_extended_request};
use vex_serial::protocol::simple::encode_simple_response;
use vex_serial::protocol::{NackCode, ACK, EXTENDED_COMMAND, REQUEST_HEADER};
use vex_serial::v5::decode_file_name;

/// Something on the far end of a [`MockChannel`]
pub trait Responder: Send {
    /// Answers one flushed transmission
    fn respond(&mut self, packet: &[u8]) -> Vec<u8>;
}

/// A [`ByteChannel`] whose far end is a [`Responder`].
///
/// Each flush hands everything written since the last one to the responder
/// and queues its answer for reading.
pub struct MockChannel<R> {
    device: Arc<Mutex<R>>,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    pub rts: Option<bool>,
    pub open: bool,
}

impl<R: Responder> MockChannel<R> {
    pub fn new(device: R) -> (Self, Handle<R>) {
        let device = Arc::new(Mutex::new(device));
        let channel = MockChannel {
            device: device.clone(),
            tx: Vec::new(),
            rx: VecDeque::new(),
            rts: None,
            open: true,
        };
        (channel, Handle(device))
    }
}

/// Lets a test inspect a device after handing its channel away
pub struct Handle<R>(Arc<Mutex<R>>);

impl<R> Handle<R> {
    pub fn get(&self) -> MutexGuard<'_, R> {
        self.0.lock().unwrap()
    }
}

impl<R: Responder> Read for MockChannel<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing to read"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, b) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl<R: Responder> Write for MockChannel<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.tx.is_empty() {
            return Ok(());
        }
        let packet = std::mem::take(&mut self.tx);
        let reply = self.device.lock().unwrap().respond(&packet);
        self.rx.extend(reply);
        Ok(())
    }
}

impl<R: Responder> ByteChannel for MockChannel<R> {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn set_request_to_send(&mut self, level: bool) -> io::Result<()> {
        self.rts = Some(level);
        Ok(())
    }
}

/// A misbehaviour applied to the next extended response
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Flip a bit in the CRC
    Corrupt,
    /// Answer with this NACK instead
    Nack(NackCode),
    /// Say nothing
    Silence,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub data: Vec<u8>,
    pub addr: u32,
    pub file_type: [u8; 4],
    pub version: u32,
    pub timestamp: u32,
    pub link: Option<(u8, String)>,
}

struct Upload {
    name: String,
    vid: u8,
    file: StoredFile,
    crc: u32,
}

struct Download {
    base: u32,
    data: Vec<u8>,
}

/// A V5 brain, or a controller in front of one, with an in-memory file system
pub struct MockBrain {
    pub product: u8,
    pub flags: u8,
    /// Firmware reported for the system, CPU0 and CPU1
    pub versions: [[u8; 4]; 3],
    pub max_packet_size: u16,
    /// Overrides the space allocated for uploads
    pub allocation: Option<u32>,
    pub files: BTreeMap<(u8, String), StoredFile>,
    pub screen: Vec<u8>,
    pub fifo: VecDeque<u8>,
    pub faults: VecDeque<Fault>,
    /// Every extended command received, in order
    pub requests: Vec<(u8, Vec<u8>)>,
    /// Channels requested through 0x10
    pub channels: Vec<u8>,
    /// Programs started (`true`) or stopped (`false`) through 0x18
    pub executions: Vec<(String, bool)>,
    /// How many version queries a controller needs before it reports the link again
    pub relink_after: u32,
    pub pending_relink: u32,
    pub upload: Option<Upload>,
    pub download: Option<Download>,
}

impl Default for MockBrain {
    fn default() -> Self {
        MockBrain {
            product: 0x10,
            flags: 0,
            versions: [[1, 1, 2, 0], [1, 0, 0, 25], [1, 0, 0, 3]],
            max_packet_size: 1024,
            allocation: None,
            files: BTreeMap::new(),
            screen: Vec::new(),
            fifo: VecDeque::new(),
            faults: VecDeque::new(),
            requests: Vec::new(),
            channels: Vec::new(),
            executions: Vec::new(),
            relink_after: 0,
            pending_relink: 0,
            upload: None,
            download: None,
        }
    }
}

impl MockBrain {
    pub fn controller(connected: bool) -> Self {
        MockBrain {
            product: 0x11,
            flags: if connected { 0x02 } else { 0 },
            ..MockBrain::default()
        }
    }

    pub fn with_file(mut self, vid: u8, name: &str, data: &[u8]) -> Self {
        self.files.insert(
            (vid, name.to_string()),
            StoredFile {
                data: data.to_vec(),
                addr: 0x0380_0000,
                file_type: file_type_of(name),
                version: 0x0100_0000,
                timestamp: 0,
                link: None,
            },
        );
        self
    }

    pub fn file(&self, vid: u8, name: &str) -> Option<&StoredFile> {
        self.files.get(&(vid, name.to_string()))
    }

    /// The extended command ids received, in order
    pub fn commands(&self) -> Vec<u8> {
        self.requests.iter().map(|(cmd, _)| *cmd).collect()
    }

    pub fn count(&self, command: u8) -> usize {
        self.requests.iter().filter(|(cmd, _)| *cmd == command).count()
    }

    fn version_reply(&mut self) -> Vec<u8> {
        let mut flags = self.flags;
        if self.pending_relink > 0 {
            self.pending_relink -= 1;
            flags &= !0x02;
        }
        let v = self.versions[0];
        encode_simple_response(0xA4, &[v[0], v[1], v[2], v[3], 0, self.product, flags, 0])
    }

    fn handle(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, NackCode> {
        match command {
            // Switch channel
            0x10 => {
                self.channels.push(payload[1]);
                if payload[1] == 0x01 {
                    self.pending_relink = self.relink_after;
                }
                Ok(Vec::new())
            }
            // Transfer init
            0x11 => self.init_transfer(payload),
            // Transfer exit
            0x12 => {
                if let Some(upload) = self.upload.take() {
                    if crc32(&upload.file.data) != upload.crc {
                        return Err(NackCode::ProgramCrcError);
                    }
                    self.files.insert((upload.vid, upload.name), upload.file);
                }
                self.download = None;
                Ok(Vec::new())
            }
            // Transfer write
            0x13 => {
                let addr = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let data = &payload[4..];
                if data.len() % 4 != 0 {
                    return Err(NackCode::DataNotMultipleOf4);
                }
                let upload = self.upload.as_mut().ok_or(NackCode::UninitializedTransfer)?;
                let offset = addr
                    .checked_sub(upload.file.addr)
                    .ok_or(NackCode::AddressMismatch)? as usize;
                let end = (offset + data.len()).min(upload.file.data.len());
                if offset > end {
                    return Err(NackCode::AddressMismatch);
                }
                upload.file.data[offset..end].copy_from_slice(&data[..end - offset]);
                Ok(Vec::new())
            }
            // Set link
            0x15 => {
                let upload = self.upload.as_mut().ok_or(NackCode::UninitializedTransfer)?;
                upload.file.link = Some((payload[0], decode_file_name(&payload[2..26])));
                Ok(Vec::new())
            }
            // Directory count
            0x16 => {
                let count = self.files.keys().filter(|(vid, _)| *vid == payload[0]).count() as u16;
                Ok(count.to_le_bytes().to_vec())
            }
            // Metadata by index, over the user VID
            0x17 => {
                let idx = payload[0];
                let (name, file) = self
                    .files
                    .iter()
                    .filter(|((vid, _), _)| *vid == 1)
                    .nth(idx as usize)
                    .map(|((_, name), file)| (name.clone(), file.clone()))
                    .ok_or(NackCode::DirectoryEntryMissing)?;
                let mut data = vec![idx];
                push_metadata(&mut data, &file);
                data.extend(name_field(&name));
                Ok(data)
            }
            // Execute
            0x18 => {
                let name = decode_file_name(&payload[2..26]);
                self.executions.push((name, payload[1] & 0x80 == 0));
                Ok(Vec::new())
            }
            // Metadata by name
            0x19 => {
                let name = decode_file_name(&payload[2..26]);
                let file = self
                    .files
                    .get(&(payload[0], name))
                    .ok_or(NackCode::DirectoryEntryMissing)?;
                let (linked_vid, linked_name) = file.link.clone().unwrap_or((0, String::new()));
                let mut data = vec![linked_vid];
                push_metadata(&mut data, file);
                data.extend(name_field(&linked_name));
                Ok(data)
            }
            // Erase
            0x1B => {
                let name = decode_file_name(&payload[2..26]);
                self.files
                    .remove(&(payload[0], name))
                    .map(|_| Vec::new())
                    .ok_or(NackCode::DirectoryEntryMissing)
            }
            // System status
            0x22 => {
                let mut data = vec![0];
                for v in self.versions {
                    data.extend(v);
                }
                data.extend([0, 0, 0, 7]);
                data.extend(0x1234_5678u32.to_le_bytes());
                data.resize(33, 0);
                Ok(data)
            }
            // User fifo
            0x27 => {
                let n = (payload[1] as usize).min(self.fifo.len());
                let mut data = vec![payload[0]];
                data.extend(self.fifo.drain(..n));
                Ok(data)
            }
            // Screen capture
            0x28 => Ok(Vec::new()),
            _ => Err(NackCode::General),
        }
    }

    fn init_transfer(&mut self, payload: &[u8]) -> Result<Vec<u8>, NackCode> {
        let word = |at: usize| u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
        let (function, target, vid) = (payload[0], payload[1], payload[2]);
        let length = word(4);
        let addr = word(8);
        let crc = word(12);
        let file_type = [payload[16], payload[17], payload[18], payload[19]];
        let timestamp = word(20);
        let version = word(24);
        let name = decode_file_name(&payload[28..52]);

        let mut reply = self.max_packet_size.to_le_bytes().to_vec();
        if function == 0x01 {
            let allocated = self.allocation.unwrap_or(length);
            self.upload = Some(Upload {
                name,
                vid,
                crc,
                file: StoredFile {
                    data: vec![0; length as usize],
                    addr,
                    file_type,
                    version,
                    timestamp,
                    link: None,
                },
            });
            reply.extend(allocated.to_le_bytes());
            reply.extend(0u32.to_le_bytes());
        } else {
            let data = if target == 0x02 {
                self.screen.clone()
            } else {
                self.files
                    .get(&(vid, name))
                    .ok_or(NackCode::DirectoryEntryMissing)?
                    .data
                    .clone()
            };
            reply.extend((data.len() as u32).to_le_bytes());
            reply.extend(crc32(&data).to_le_bytes());
            self.download = Some(Download { base: addr, data });
        }
        Ok(reply)
    }

    /// Transfer reads carry no ACK byte
    fn read_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        let addr = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let length = u16::from_le_bytes([payload[4], payload[5]]) as usize;
        let mut data = addr.to_le_bytes().to_vec();
        if let Some(download) = &self.download {
            let start = (addr - download.base) as usize;
            let available = download.data.get(start..).unwrap_or_default();
            data.extend(&available[..length.min(available.len())]);
        }
        data.resize(4 + length, 0);
        encode_extended_response(0x14, None, &data).unwrap()
    }
}

impl Responder for MockBrain {
    fn respond(&mut self, packet: &[u8]) -> Vec<u8> {
        assert_eq!(&packet[..4], &REQUEST_HEADER, "bad request header");
        if packet[4] != EXTENDED_COMMAND {
            assert_eq!(packet[4], 0xA4, "unknown simple command");
            return self.version_reply();
        }

        let (command, payload) = parse_extended_request(packet).unwrap();
        self.requests.push((command, payload.clone()));

        match self.faults.pop_front() {
            Some(Fault::Silence) => return Vec::new(),
            Some(Fault::Nack(code)) => {
                return encode_extended_response(command, Some(code as u8), &[]).unwrap()
            }
            Some(Fault::Corrupt) => {
                let mut reply = self.reply(command, &payload);
                if let Some(last) = reply.last_mut() {
                    *last ^= 0x01;
                }
                return reply;
            }
            None => {}
        }
        self.reply(command, &payload)
    }
}

impl MockBrain {
    fn reply(&mut self, command: u8, payload: &[u8]) -> Vec<u8> {
        if command == 0x14 {
            return self.read_chunk(payload);
        }
        match self.handle(command, payload) {
            Ok(data) => encode_extended_response(command, Some(ACK), &data).unwrap(),
            Err(code) => encode_extended_response(command, Some(code as u8), &[]).unwrap(),
        }
    }
}

fn push_metadata(data: &mut Vec<u8>, file: &StoredFile) {
    data.extend((file.data.len() as u32).to_le_bytes());
    data.extend(file.addr.to_le_bytes());
    data.extend(crc32(&file.data).to_le_bytes());
    data.extend(file.file_type);
    data.extend(file.timestamp.to_le_bytes());
    data.extend(file.version.to_le_bytes());
}

fn name_field(name: &str) -> [u8; 24] {
    let mut field = [0u8; 24];
    for (slot, b) in field.iter_mut().zip(name.bytes()) {
        *slot = b;
    }
    field
}

fn file_type_of(name: &str) -> [u8; 4] {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let mut t = [0u8; 4];
    for (slot, b) in t.iter_mut().zip(ext.bytes().take(3)) {
        *slot = b;
    }
    t
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WriteData(u32),
    GoAddress,
    Erase,
    ExtendedErase,
}

/// An STM32 ROM bootloader in front of a small flash
pub struct MockBootloader {
    pub flash: Vec<u8>,
    pub commands: Vec<u8>,
    /// Command bytes answered with a NACK
    pub refuse: Vec<u8>,
    pub initialized: bool,
    pub jumped: Option<u32>,
    /// Every erase argument received, raw
    pub erases: Vec<Vec<u8>>,
    pub messages: Vec<Vec<u8>>,
    pub stage: Stage,
}

impl Default for MockBootloader {
    fn default() -> Self {
        MockBootloader {
            flash: vec![0xFF; 0x4000],
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92],
            refuse: Vec::new(),
            initialized: false,
            jumped: None,
            erases: Vec::new(),
            messages: Vec::new(),
            stage: Stage::Idle,
        }
    }
}

impl MockBootloader {
    fn block(msg: &[u8]) -> Option<&[u8]> {
        let (data, xor) = msg.split_at(msg.len().checked_sub(1)?);
        (data.iter().fold(0, |acc, b| acc ^ b) == xor[0]).then_some(data)
    }

    fn address(msg: &[u8]) -> Option<u32> {
        match Self::block(msg)? {
            [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    fn offset(&self, addr: u32) -> usize {
        (addr - FLASH_START) as usize
    }
}

impl Responder for MockBootloader {
    fn respond(&mut self, msg: &[u8]) -> Vec<u8> {
        self.messages.push(msg.to_vec());
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);

        match stage {
            Stage::Idle => {
                if msg == [0x7F] {
                    self.initialized = true;
                    return vec![STM32_ACK];
                }
                let command = match msg {
                    [c, n] if *c == !*n => *c,
                    _ => return vec![STM32_NACK],
                };
                if self.refuse.contains(&command) {
                    return vec![STM32_NACK];
                }
                match command {
                    0x00 => {
                        let mut reply = vec![STM32_ACK, self.commands.len() as u8, 0x22];
                        reply.extend(&self.commands);
                        reply.push(STM32_ACK);
                        reply
                    }
                    0x02 => vec![STM32_ACK, 0x01, 0x04, 0x14, STM32_ACK],
                    0x11 => {
                        self.stage = Stage::ReadAddress;
                        vec![STM32_ACK]
                    }
                    0x21 => {
                        self.stage = Stage::GoAddress;
                        vec![STM32_ACK]
                    }
                    0x31 => {
                        self.stage = Stage::WriteAddress;
                        vec![STM32_ACK]
                    }
                    0x43 if self.commands.contains(&0x43) => {
                        self.stage = Stage::Erase;
                        vec![STM32_ACK]
                    }
                    0x44 if self.commands.contains(&0x44) => {
                        self.stage = Stage::ExtendedErase;
                        vec![STM32_ACK]
                    }
                    _ => vec![STM32_NACK],
                }
            }
            Stage::ReadAddress => match Self::address(msg) {
                Some(addr) => {
                    self.stage = Stage::ReadLength(addr);
                    vec![STM32_ACK]
                }
                None => vec![STM32_NACK],
            },
            Stage::ReadLength(addr) => match msg {
                [n, c] if *c == !*n => {
                    let start = self.offset(addr);
                    let mut reply = vec![STM32_ACK];
                    reply.extend(&self.flash[start..start + *n as usize + 1]);
                    reply
                }
                _ => vec![STM32_NACK],
            },
            Stage::WriteAddress => match Self::address(msg) {
                Some(addr) => {
                    self.stage = Stage::WriteData(addr);
                    vec![STM32_ACK]
                }
                None => vec![STM32_NACK],
            },
            Stage::WriteData(addr) => match Self::block(msg) {
                Some([n, data @ ..]) if data.len() == *n as usize + 1 => {
                    let start = self.offset(addr);
                    self.flash[start..start + data.len()].copy_from_slice(data);
                    vec![STM32_ACK]
                }
                _ => vec![STM32_NACK],
            },
            Stage::GoAddress => match Self::address(msg) {
                Some(addr) => {
                    self.jumped = Some(addr);
                    vec![STM32_ACK]
                }
                None => vec![STM32_NACK],
            },
            Stage::Erase => {
                self.erases.push(msg.to_vec());
                if msg == [0xFF, 0x00] {
                    self.flash.iter_mut().for_each(|b| *b = 0xFF);
                    return vec![STM32_ACK];
                }
                match Self::block(msg) {
                    Some([n, pages @ ..]) if pages.len() == *n as usize + 1 => {
                        for page in pages {
                            let start = *page as usize * 0x2000;
                            let len = self.flash.len();
                            if let Some(region) = self.flash.get_mut(start..(start + 0x2000).min(len)) {
                                region.iter_mut().for_each(|b| *b = 0xFF);
                            }
                        }
                        vec![STM32_ACK]
                    }
                    _ => vec![STM32_NACK],
                }
            }
            Stage::ExtendedErase => {
                self.erases.push(msg.to_vec());
                vec![STM32_ACK]
            }
        }
    }
}

/// A Cortex that hands its channel to the bootloader once asked to
pub struct MockCortex {
    pub flags: u8,
    /// Answering as the bootloader
    pub exposed: bool,
    pub expose_requests: usize,
    pub download_requests: usize,
    pub bootloader: MockBootloader,
}

impl MockCortex {
    pub fn new(flags: u8) -> Self {
        MockCortex {
            flags,
            exposed: false,
            expose_requests: 0,
            download_requests: 0,
            bootloader: MockBootloader::default(),
        }
    }
}

impl Responder for MockCortex {
    fn respond(&mut self, packet: &[u8]) -> Vec<u8> {
        if self.exposed {
            return self.bootloader.respond(packet);
        }
        if packet.len() != 5 || packet[..4] != REQUEST_HEADER {
            // The robot ignores bootloader traffic
            return Vec::new();
        }
        match packet[4] {
            0x21 => encode_simple_response(0x21, &[3, 20, 3, 21, 140, 130, 150, self.flags, 0, 0]),
            0x35 => {
                self.download_requests += 1;
                vec![ACK]
            }
            0x25 => {
                self.expose_requests += 1;
                if self.expose_requests == 5 {
                    self.exposed = true;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}
