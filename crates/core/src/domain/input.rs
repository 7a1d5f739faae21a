//! Player input sources

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::reader::MediaStream;

/// Where the player reads its encoded audio from
pub enum PlayerInput {
    /// A file on disk, reopened on demand
    File(PathBuf),
    /// Shared bytes owned elsewhere
    MemoryBlock(Arc<[u8]>),
    /// Bytes handed over to the player
    MemoryStream(Vec<u8>),
    /// Any seekable byte stream; cannot be reopened
    Stream(Box<dyn MediaStream>),
}

/// Kind of the current input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    None,
    File,
    MemoryBlock,
    MemoryStream,
    Stream,
}

impl PlayerInput {
    pub fn kind(&self) -> InputKind {
        match self {
            PlayerInput::File(_) => InputKind::File,
            PlayerInput::MemoryBlock(_) => InputKind::MemoryBlock,
            PlayerInput::MemoryStream(_) => InputKind::MemoryStream,
            PlayerInput::Stream(_) => InputKind::Stream,
        }
    }

    /// Open a byte stream for decoding and keep what is needed to reopen it
    pub fn open(self) -> std::io::Result<(Box<dyn MediaStream>, RetainedInput)> {
        match self {
            PlayerInput::File(path) => {
                let stream = open_file(&path)?;
                Ok((stream, RetainedInput::File(path)))
            }
            PlayerInput::MemoryBlock(bytes) => Ok((
                Box::new(Cursor::new(Arc::clone(&bytes))),
                RetainedInput::Memory {
                    kind: InputKind::MemoryBlock,
                    bytes,
                },
            )),
            PlayerInput::MemoryStream(bytes) => {
                let bytes: Arc<[u8]> = bytes.into();
                Ok((
                    Box::new(Cursor::new(Arc::clone(&bytes))),
                    RetainedInput::Memory {
                        kind: InputKind::MemoryStream,
                        bytes,
                    },
                ))
            }
            PlayerInput::Stream(stream) => Ok((stream, RetainedInput::Stream)),
        }
    }
}

impl std::fmt::Debug for PlayerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerInput::File(path) => f.debug_tuple("File").field(path).finish(),
            PlayerInput::MemoryBlock(bytes) => f.debug_tuple("MemoryBlock").field(&bytes.len()).finish(),
            PlayerInput::MemoryStream(bytes) => f.debug_tuple("MemoryStream").field(&bytes.len()).finish(),
            PlayerInput::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// What the player keeps of its input after handing the stream to a reader
#[derive(Debug, Clone, Default)]
pub enum RetainedInput {
    #[default]
    None,
    File(PathBuf),
    Memory { kind: InputKind, bytes: Arc<[u8]> },
    Stream,
}

impl RetainedInput {
    pub fn kind(&self) -> InputKind {
        match self {
            RetainedInput::None => InputKind::None,
            RetainedInput::File(_) => InputKind::File,
            RetainedInput::Memory { kind, .. } => *kind,
            RetainedInput::Stream => InputKind::Stream,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            RetainedInput::File(path) => Some(path),
            _ => None,
        }
    }

    /// Open a fresh stream positioned at the start
    ///
    /// Generic streams were consumed by the reader and yield `None`.
    pub fn reopen(&self) -> Option<std::io::Result<Box<dyn MediaStream>>> {
        match self {
            RetainedInput::File(path) => Some(open_file(path)),
            RetainedInput::Memory { bytes, .. } => {
                Some(Ok(Box::new(Cursor::new(Arc::clone(bytes))) as Box<dyn MediaStream>))
            }
            RetainedInput::None | RetainedInput::Stream => None,
        }
    }
}

fn open_file(path: &Path) -> std::io::Result<Box<dyn MediaStream>> {
    let file = File::open(path)?;
    Ok(Box::new(BufReader::new(file)))
}
