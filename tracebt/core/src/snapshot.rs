//! JSON snapshot of a stopped target: registers, CPSR, the stack words the
//! unwinder may read, a symbol table and per-mode disassembly listings.
//!
//! Numbers may be written either as JSON integers or as `"0x..."` strings.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracebt_listing::{parse_address, Mode, Register, StaticListing};
use tracing::debug;

use crate::frame::Frame;
use crate::target::{FrameSink, SymbolResolver, Target, TargetError};
use crate::{CoreError, Result};

pub const SNAPSHOT_MAGIC: &str = "tracebt.snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

/// 32-bit value accepting `123` or `"0x7b"` on input; written as hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Word(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum WordSerde {
    Int(u32),
    Text(String),
}

impl<'de> Deserialize<'de> for Word {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match WordSerde::deserialize(deserializer)? {
            WordSerde::Int(value) => Ok(Word(value)),
            WordSerde::Text(text) => parse_address(&text).map(Word).map_err(D::Error::custom),
        }
    }
}

impl Serialize for Word {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub start: Word,
    /// Exclusive.
    pub end: Word,
    pub name: String,
    #[serde(default)]
    pub library: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingText {
    #[serde(default)]
    pub arm: String,
    #[serde(default)]
    pub thumb: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_magic")]
    pub magic: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub registers: BTreeMap<String, Word>,
    #[serde(default)]
    pub cpsr: Word,
    /// `(address, word)` pairs; addresses are word aligned.
    #[serde(default)]
    pub memory: Vec<(Word, Word)>,
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
    #[serde(default)]
    pub listing: ListingText,
    #[serde(skip)]
    selected: Option<Frame>,
}

fn default_magic() -> String {
    SNAPSHOT_MAGIC.to_string()
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            magic: default_magic(),
            version: default_version(),
            registers: BTreeMap::new(),
            cpsr: Word(0),
            memory: Vec::new(),
            symbols: Vec::new(),
            listing: ListingText::default(),
            selected: None,
        }
    }
}

impl Snapshot {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<()> {
        if self.magic != SNAPSHOT_MAGIC || self.version != SNAPSHOT_VERSION {
            return Err(CoreError::InvalidSnapshot(
                "snapshot magic/version mismatch".to_string(),
            ));
        }
        for name in self.registers.keys() {
            if name != "cpsr" {
                name.parse::<Register>()?;
            }
        }
        Ok(())
    }

    pub fn set_register(&mut self, reg: Register, value: u32) {
        self.registers.insert(reg.to_string(), Word(value));
    }

    pub fn write_word(&mut self, address: u32, value: u32) {
        match self.memory.iter_mut().find(|(addr, _)| addr.0 == address) {
            Some(slot) => slot.1 = Word(value),
            None => self.memory.push((Word(address), Word(value))),
        }
    }

    /// Decoded listings for both modes.
    pub fn instruction_source(&self) -> StaticListing {
        let mut listing = StaticListing::new();
        let arm = listing.add_text(Mode::Arm, &self.listing.arm);
        let thumb = listing.add_text(Mode::Thumb, &self.listing.thumb);
        debug!("snapshot listing: {arm} arm, {thumb} thumb instructions");
        listing
    }

    /// Frame most recently handed to [`FrameSink::select_frame`].
    pub fn selected_frame(&self) -> Option<&Frame> {
        self.selected.as_ref()
    }

    fn lookup_register(&self, reg: Register) -> Option<u32> {
        self.registers.iter().find_map(|(name, value)| {
            (name.parse::<Register>().ok() == Some(reg)).then_some(value.0)
        })
    }

    fn symbol_at(&self, address: u32) -> Option<&SymbolEntry> {
        self.symbols
            .iter()
            .find(|sym| sym.start.0 <= address && address < sym.end.0)
    }
}

impl Target for Snapshot {
    fn read_u32(&mut self, address: u32) -> std::result::Result<u32, TargetError> {
        self.memory
            .iter()
            .find(|(addr, _)| addr.0 == address)
            .map(|(_, value)| value.0)
            .ok_or(TargetError::Memory(address))
    }

    fn read_register(&mut self, reg: Register) -> std::result::Result<u32, TargetError> {
        self.lookup_register(reg).ok_or(TargetError::Register(reg))
    }

    fn read_status(&mut self) -> std::result::Result<u32, TargetError> {
        Ok(self.cpsr.0)
    }

    fn write_status(&mut self, value: u32) -> std::result::Result<(), TargetError> {
        self.cpsr = Word(value);
        Ok(())
    }
}

impl SymbolResolver for Snapshot {
    fn function_name(&mut self, address: u32) -> Option<String> {
        self.symbol_at(address).map(|sym| sym.name.clone())
    }

    fn library_name(&mut self, address: u32) -> Option<String> {
        self.symbol_at(address).and_then(|sym| sym.library.clone())
    }
}

impl FrameSink for Snapshot {
    fn select_frame(&mut self, frame: &Frame) -> std::result::Result<(), TargetError> {
        self.selected = Some(frame.clone());
        Ok(())
    }
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let file = File::open(path)?;
    Snapshot::from_reader(BufReader::new(file))
}
