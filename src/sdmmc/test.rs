//! A byte-level SD card on a fake SPI bus.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use super::proto::*;
use super::*;
use crate::fat::{test::Fat32Image, StreamOutcome, Volume};
use crate::{Block, BlockCount, BlockDevice, BlockIdx, BusLock, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Select,
    Deselect,
    Command(u8, u32),
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Command,
    ReadMultiple(u32),
    AwaitToken { sector: u32, multi: bool },
    Receive { sector: u32, multi: bool, data: Vec<u8> },
}

struct Card {
    memory: Vec<u8>,
    csd: [u8; 16],
    selected: bool,
    phase: Phase,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    events: Vec<Event>,
    /// CMD1 answers "still idle" this many times
    idle_polls: u32,
    write_response: u8,
    reject: Option<u8>,
    silent: bool,
    stuck_busy: bool,
    /// The SPI peripheral fails any transfer made with the card deselected
    fault_when_deselected: bool,
    erase_start: u32,
    erase_end: u32,
}

/// A CSD describing a card of exactly `sectors` sectors (a multiple of four).
fn csd_for(sectors: u32) -> [u8; 16] {
    let c_size = sectors / 4 - 1;
    let mut csd = [0u8; 16];
    csd[5] = 0x59;
    csd[6] = ((c_size >> 10) & 0x03) as u8;
    csd[7] = (c_size >> 2) as u8;
    csd[8] = ((c_size & 0x03) << 6) as u8;
    csd
}

impl Card {
    fn new(memory: Vec<u8>) -> Card {
        let sectors = (memory.len() / Block::LEN) as u32;
        Card {
            memory,
            csd: csd_for(sectors),
            selected: false,
            phase: Phase::Command,
            frame: Vec::new(),
            out: VecDeque::new(),
            events: Vec::new(),
            idle_polls: 0,
            write_response: 0xE5,
            reject: None,
            silent: false,
            stuck_busy: false,
            fault_when_deselected: false,
            erase_start: 0,
            erase_end: 0,
        }
    }

    fn sector(&self, sector: u32) -> &[u8] {
        let start = sector as usize * Block::LEN;
        &self.memory[start..start + Block::LEN]
    }

    fn queue_data(&mut self, sector: u32) {
        self.out.push_back(0xFF);
        self.out.push_back(DATA_START_BLOCK);
        let start = sector as usize * Block::LEN;
        let data = match self.memory.get(start..start + Block::LEN) {
            Some(data) => data.to_vec(),
            None => vec![0u8; Block::LEN],
        };
        self.out.extend(data);
        self.out.extend(&[0x12, 0x34]);
    }

    fn exchange(&mut self, incoming: u8) -> u8 {
        if !self.selected || self.silent {
            return 0xFF;
        }
        if self.out.is_empty() && self.frame.is_empty() {
            if let Phase::ReadMultiple(sector) = self.phase {
                self.queue_data(sector);
                self.phase = Phase::ReadMultiple(sector + 1);
            }
        }
        let outgoing = self.out.pop_front().unwrap_or(if self.stuck_busy {
            0x00
        } else {
            0xFF
        });
        self.consume(incoming);
        outgoing
    }

    fn consume(&mut self, incoming: u8) {
        match core::mem::replace(&mut self.phase, Phase::Command) {
            Phase::Command => self.collect(incoming),
            Phase::ReadMultiple(sector) => {
                if incoming == 0xFF && self.frame.is_empty() {
                    self.phase = Phase::ReadMultiple(sector);
                } else {
                    // The host broke off to send STOP_TRANSMISSION
                    self.out.clear();
                    self.collect(incoming);
                }
            }
            Phase::AwaitToken { sector, multi } => match incoming {
                DATA_START_BLOCK if !multi => {
                    self.phase = Phase::Receive {
                        sector,
                        multi,
                        data: Vec::new(),
                    }
                }
                WRITE_MULTIPLE_TOKEN if multi => {
                    self.phase = Phase::Receive {
                        sector,
                        multi,
                        data: Vec::new(),
                    }
                }
                STOP_TRAN_TOKEN if multi => self.out.extend(&[0x00, 0x00]),
                _ => self.phase = Phase::AwaitToken { sector, multi },
            },
            Phase::Receive {
                sector,
                multi,
                mut data,
            } => {
                data.push(incoming);
                if data.len() < Block::LEN + 2 {
                    self.phase = Phase::Receive {
                        sector,
                        multi,
                        data,
                    };
                    return;
                }
                self.out.push_back(self.write_response);
                if self.write_response & DATA_RES_MASK != DATA_RES_ACCEPTED {
                    return;
                }
                let start = sector as usize * Block::LEN;
                self.memory[start..start + Block::LEN].copy_from_slice(&data[..Block::LEN]);
                self.out.extend(&[0x00, 0x00, 0x00]);
                if multi {
                    self.phase = Phase::AwaitToken {
                        sector: sector + 1,
                        multi,
                    };
                }
            }
        }
    }

    fn collect(&mut self, incoming: u8) {
        if self.frame.is_empty() && incoming & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(incoming);
        if self.frame.len() == 6 {
            let command = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            self.frame.clear();
            self.command(command, arg);
        }
    }

    fn command(&mut self, command: u8, arg: u32) {
        self.events.push(Event::Command(command, arg));
        if command == CMD12 {
            // Stuff byte, R1, one byte of busy
            self.out.extend(&[0xFF, 0x00, 0x00]);
            return;
        }
        self.out.push_back(0xFF);
        if self.reject == Some(command) {
            self.out.push_back(0x04);
            return;
        }
        let sector = arg / Block::LEN_U32;
        match command {
            CMD0 => self.out.push_back(R1_IDLE_STATE),
            CMD1 => {
                if self.idle_polls > 0 {
                    self.idle_polls -= 1;
                    self.out.push_back(R1_IDLE_STATE);
                } else {
                    self.out.push_back(R1_READY_STATE);
                }
            }
            CMD9 => {
                self.out.push_back(R1_READY_STATE);
                self.out.push_back(0xFF);
                self.out.push_back(DATA_START_BLOCK);
                let csd = self.csd;
                self.out.extend(&csd);
                self.out.extend(&[0x00, 0x00]);
            }
            CMD17 => {
                self.out.push_back(R1_READY_STATE);
                self.queue_data(sector);
            }
            CMD18 => {
                self.out.push_back(R1_READY_STATE);
                self.phase = Phase::ReadMultiple(sector);
            }
            CMD24 | CMD25 => {
                self.out.push_back(R1_READY_STATE);
                self.phase = Phase::AwaitToken {
                    sector,
                    multi: command == CMD25,
                };
            }
            CMD32 => {
                self.erase_start = sector;
                self.out.push_back(R1_READY_STATE);
            }
            CMD33 => {
                self.erase_end = sector;
                self.out.push_back(R1_READY_STATE);
            }
            CMD38 => {
                let start = self.erase_start as usize * Block::LEN;
                let end = (self.erase_end as usize + 1) * Block::LEN;
                for b in self.memory[start..end].iter_mut() {
                    *b = 0xFF;
                }
                self.out.extend(&[R1_READY_STATE, 0x00, 0x00]);
            }
            _ => self.out.push_back(0x04),
        }
    }
}

#[derive(Clone)]
struct FakeSpi(Rc<RefCell<Card>>);

impl Transfer<u8> for FakeSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        let mut card = self.0.borrow_mut();
        if card.fault_when_deselected && !card.selected {
            return Err(());
        }
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

struct FakeCs(Rc<RefCell<Card>>);

impl OutputPin for FakeCs {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        let mut card = self.0.borrow_mut();
        card.selected = true;
        card.events.push(Event::Select);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        let mut card = self.0.borrow_mut();
        card.selected = false;
        card.out.clear();
        card.frame.clear();
        card.phase = Phase::Command;
        card.events.push(Event::Deselect);
        Ok(())
    }
}

struct FakeLock(Rc<RefCell<Card>>);

impl BusLock for FakeLock {
    fn lock(&mut self) {
        self.0.borrow_mut().events.push(Event::Lock);
    }

    fn unlock(&mut self) {
        self.0.borrow_mut().events.push(Event::Unlock);
    }
}

type FakeDriver<State> = SdMmcSpi<FakeSpi, FakeCs, FakeLock, State>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn card_with_memory(memory: Vec<u8>) -> (Rc<RefCell<Card>>, FakeDriver<NotInit>) {
    init();
    let card = Rc::new(RefCell::new(Card::new(memory)));
    let driver = SdMmcSpi::with_bus_lock(
        FakeSpi(card.clone()),
        FakeCs(card.clone()),
        FakeLock(card.clone()),
    );
    (card, driver)
}

fn acquired(sectors: usize) -> (Rc<RefCell<Card>>, FakeDriver<Initialized>) {
    let (card, driver) = card_with_memory(vec![0u8; sectors * Block::LEN]);
    match driver.acquire() {
        Ok(driver) => (card, driver),
        Err((e, _)) => panic!("acquire failed: {:?}", e),
    }
}

fn pattern(seed: u8) -> [u8; Block::LEN] {
    let mut data = [0u8; Block::LEN];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(seed);
    }
    data
}

#[test]
fn reset_and_initialize() {
    let (card, driver) = card_with_memory(vec![0u8; 64 * Block::LEN]);
    card.borrow_mut().idle_polls = 3;
    let driver = match driver.acquire() {
        Ok(driver) => driver,
        Err((e, _)) => panic!("acquire failed: {:?}", e),
    };
    let card = card.borrow();
    let cmd1s = card
        .events
        .iter()
        .filter(|e| **e == Event::Command(CMD1, 0))
        .count();
    assert_eq!(cmd1s, 4);
    assert_eq!(
        &card.events[..5],
        &[
            Event::Lock,
            Event::Deselect,
            Event::Select,
            Event::Command(CMD0, 0),
            Event::Deselect
        ]
    );
    assert_eq!(card.events.last(), Some(&Event::Unlock));
    assert!(!card.selected);
    drop(driver);
}

#[test]
fn silent_card_fails_reset() {
    let (card, driver) = card_with_memory(vec![0u8; 64 * Block::LEN]);
    card.borrow_mut().silent = true;
    match driver.acquire() {
        Err((Error::ResetFailed, _)) => {}
        Err((e, _)) => panic!("unexpected error {:?}", e),
        Ok(_) => panic!("a silent card came up"),
    }
    let card = card.borrow();
    assert_eq!(card.events.last(), Some(&Event::Unlock));
    assert!(!card.selected);
}

#[test]
fn card_stuck_in_idle() {
    let (card, driver) = card_with_memory(vec![0u8; 64 * Block::LEN]);
    card.borrow_mut().idle_polls = u32::MAX;
    let driver = match driver.acquire() {
        Err((Error::InitTimeout, driver)) => driver,
        Err((e, _)) => panic!("unexpected error {:?}", e),
        Ok(_) => panic!("an idle card came up"),
    };
    let cmd1s = card
        .borrow()
        .events
        .iter()
        .filter(|e| **e == Event::Command(CMD1, 0))
        .count();
    assert_eq!(cmd1s as u32, INIT_ATTEMPTS + 1);

    // Once the card wakes up the same driver can try again
    card.borrow_mut().idle_polls = 0;
    assert!(driver.acquire().is_ok());
}

#[test]
fn sector_round_trip() {
    let (card, mut driver) = acquired(64);
    let data = pattern(3);
    driver.write_sector(BlockIdx(5), &data).unwrap();
    assert_eq!(card.borrow().sector(5), &data[..]);

    let mut read_back = [0u8; Block::LEN];
    driver.read_sector(BlockIdx(5), &mut read_back).unwrap();
    assert_eq!(&read_back[..], &data[..]);
    assert!(card
        .borrow()
        .events
        .contains(&Event::Command(CMD24, 5 * 512)));
    assert!(card
        .borrow()
        .events
        .contains(&Event::Command(CMD17, 5 * 512)));
}

#[test]
fn multi_sector_round_trip() {
    let (card, mut driver) = acquired(64);
    let mut data = vec![0u8; 3 * Block::LEN];
    for (i, chunk) in data.chunks_mut(Block::LEN).enumerate() {
        chunk.copy_from_slice(&pattern(i as u8 + 40));
    }
    driver
        .write_sectors(BlockIdx(10), &data, BlockCount(3))
        .unwrap();
    for i in 0..3 {
        assert_eq!(
            card.borrow().sector(10 + i as u32),
            &data[i * Block::LEN..(i + 1) * Block::LEN]
        );
    }

    let mut read_back = vec![0u8; 4 * Block::LEN];
    driver
        .read_sectors(BlockIdx(10), &mut read_back, BlockCount(3))
        .unwrap();
    assert_eq!(&read_back[..3 * Block::LEN], &data[..]);
    assert!(read_back[3 * Block::LEN..].iter().all(|b| *b == 0));

    let card = card.borrow();
    let events = &card.events;
    assert!(events.contains(&Event::Command(CMD25, 10 * 512)));
    assert!(events.contains(&Event::Command(CMD18, 10 * 512)));
    assert!(events.contains(&Event::Command(CMD12, 0)));
}

#[test]
fn block_device_interface() {
    let (_card, mut driver) = acquired(64);
    let blocks = [
        Block { contents: pattern(1) },
        Block { contents: pattern(2) },
    ];
    driver.write(&blocks, BlockIdx(20)).unwrap();
    driver.write_block(&blocks[1], BlockIdx(30)).unwrap();

    let mut read_back = [Block::new(), Block::new()];
    driver.read(&mut read_back, BlockIdx(20), "test").unwrap();
    assert_eq!(read_back, blocks);
    assert_eq!(driver.read_block(BlockIdx(30), "test").unwrap(), blocks[1]);
    assert_eq!(driver.num_blocks().unwrap(), BlockCount(64));
}

#[test]
fn rejected_write_deselects_card() {
    let (card, mut driver) = acquired(64);
    card.borrow_mut().write_response = 0x0B;
    card.borrow_mut().events.clear();
    assert_eq!(
        driver.write_sector(BlockIdx(1), &pattern(9)),
        Err(Error::WriteRejected)
    );
    let card = card.borrow();
    assert_eq!(
        card.events,
        vec![
            Event::Lock,
            Event::Select,
            Event::Command(CMD24, 512),
            Event::Deselect,
            Event::Unlock
        ]
    );
    assert!(!card.selected);
    assert_eq!(card.sector(1), &[0u8; Block::LEN][..]);
}

#[test]
fn rejected_commands() {
    let (card, mut driver) = acquired(64);
    let mut buffer = [0u8; Block::LEN];

    card.borrow_mut().reject = Some(CMD17);
    assert_eq!(
        driver.read_sector(BlockIdx(0), &mut buffer),
        Err(Error::CommandRejected)
    );

    card.borrow_mut().reject = Some(CMD9);
    assert_eq!(driver.read_csd(), Err(Error::CsdReadFailed));

    card.borrow_mut().reject = Some(CMD32);
    assert_eq!(
        driver.erase_sectors(BlockIdx(0), BlockCount(2)),
        Err(Error::EraseStartRejected)
    );
    card.borrow_mut().reject = Some(CMD33);
    assert_eq!(
        driver.erase_sectors(BlockIdx(0), BlockCount(2)),
        Err(Error::EraseEndRejected)
    );
    card.borrow_mut().reject = Some(CMD38);
    assert_eq!(
        driver.erase_sectors(BlockIdx(0), BlockCount(2)),
        Err(Error::EraseRejected)
    );
    assert!(!card.borrow().selected);
}

#[test]
fn read_csd_and_capacity() {
    let (card, mut driver) = acquired(64);
    assert_eq!(driver.capacity_bytes().unwrap(), 64 * 512);

    card.borrow_mut().csd = hex_literal::hex!("002600325f5983fff6dbff81968000e7");
    let csd = driver.read_csd().unwrap();
    assert_eq!(csd.card_capacity_bytes(), 1_073_741_824);
    assert_eq!(driver.num_blocks().unwrap(), BlockCount(2_097_152));
}

#[test]
fn erase_range() {
    let (card, mut driver) = acquired(64);
    for sector in 4..8 {
        driver.write_sector(BlockIdx(sector), &pattern(5)).unwrap();
    }
    driver.erase_sectors(BlockIdx(5), BlockCount(2)).unwrap();
    let card_ref = card.borrow();
    assert_eq!(card_ref.sector(4), &pattern(5)[..]);
    assert!(card_ref.sector(5).iter().all(|b| *b == 0xFF));
    assert!(card_ref.sector(6).iter().all(|b| *b == 0xFF));
    assert_eq!(card_ref.sector(7), &pattern(5)[..]);
    assert!(card_ref.events.contains(&Event::Command(CMD32, 5 * 512)));
    assert!(card_ref.events.contains(&Event::Command(CMD33, 6 * 512)));
    drop(card_ref);

    card.borrow_mut().events.clear();
    driver.erase_sectors(BlockIdx(5), BlockCount(0)).unwrap();
    assert!(card.borrow().events.is_empty());
}

#[test]
fn short_buffer() {
    let (card, mut driver) = acquired(64);
    card.borrow_mut().events.clear();
    let mut buffer = [0u8; 700];
    assert_eq!(
        driver.read_sectors(BlockIdx(0), &mut buffer, BlockCount(2)),
        Err(Error::BufferTooSmall)
    );
    assert_eq!(
        driver.write_sectors(BlockIdx(0), &buffer, BlockCount(2)),
        Err(Error::BufferTooSmall)
    );
    assert!(card.borrow().events.is_empty());
}

#[test]
fn sector_beyond_byte_addressing() {
    let (_card, mut driver) = acquired(64);
    let mut buffer = [0u8; Block::LEN];
    assert_eq!(
        driver.read_sector(BlockIdx(0x0080_0000), &mut buffer),
        Err(Error::OutOfRange)
    );
}

#[test]
fn busy_card_times_out() {
    let (card, mut driver) = acquired(64);
    card.borrow_mut().stuck_busy = true;
    let mut buffer = [0u8; Block::LEN];
    assert_eq!(
        driver.read_sector(BlockIdx(0), &mut buffer),
        Err(Error::BusyTimeout)
    );
    let card = card.borrow();
    assert!(!card.selected);
    assert_eq!(card.events.last(), Some(&Event::Unlock));
}

#[test]
fn deinit_and_free() {
    let (card, driver) = acquired(64);
    let driver = driver.deinit();
    let (spi, cs, lock) = driver.free();
    let driver = SdMmcSpi::with_bus_lock(spi, cs, lock);
    assert!(driver.acquire().is_ok());
    assert!(!card.borrow().selected);
}

#[test]
fn fat_volume_over_spi() {
    let image = Fat32Image::small().build();
    let (_card, driver) = card_with_memory(image);
    let mut driver = match driver.acquire() {
        Ok(driver) => driver,
        Err((e, _)) => panic!("acquire failed: {:?}", e),
    };

    let volume = Volume::mount(&mut driver).unwrap();
    let contents: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    volume
        .write_stream(
            &mut driver,
            "PODS.ANI",
            contents.len() as u32,
            crate::fat::SliceSource::new(&contents),
        )
        .unwrap();

    let file = volume.open_file(&mut driver, "pods.ani").unwrap();
    assert_eq!(file.size(), 1500);

    let mut buffer = [0u8; 1024];
    let (outcome, cursor) = volume
        .read_stream(&mut driver, &file, None, &mut buffer)
        .unwrap();
    assert_eq!(outcome, StreamOutcome::BufferFull);
    assert_eq!(&buffer[..], &contents[..1024]);
    let (outcome, _) = volume
        .read_stream(&mut driver, &file, Some(cursor), &mut buffer)
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Complete { filled: 512 });
    assert_eq!(&buffer[..476], &contents[1024..]);
}

#[test]
fn trailing_clock_fault_is_reported() {
    let (card, mut driver) = acquired(64);
    card.borrow_mut().fault_when_deselected = true;
    let mut buffer = [0u8; Block::LEN];
    assert_eq!(
        driver.read_sector(BlockIdx(1), &mut buffer),
        Err(Error::Transport)
    );
    let card = card.borrow();
    assert!(!card.selected);
    assert_eq!(card.events.last(), Some(&Event::Unlock));
}

#[test]
fn command_error_wins_over_trailing_fault() {
    let (card, mut driver) = acquired(64);
    {
        let mut card = card.borrow_mut();
        card.fault_when_deselected = true;
        card.reject = Some(CMD17);
    }
    let mut buffer = [0u8; Block::LEN];
    assert_eq!(
        driver.read_sector(BlockIdx(1), &mut buffer),
        Err(Error::CommandRejected)
    );
}
