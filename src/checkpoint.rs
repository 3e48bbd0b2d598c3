use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use log::info;
use parking_lot::Mutex;

use crate::error::Result;

/// Serializes flat parameter buffers.
pub trait ModelCodec {
    fn encode(&self, params: &[f32], writer: &mut dyn Write) -> io::Result<()>;

    fn decode(&self, reader: &mut dyn Read) -> io::Result<Vec<f32>>;
}

/// Writes the parameters as raw little-endian `f32`s, without any header.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl ModelCodec for RawCodec {
    fn encode(&self, params: &[f32], writer: &mut dyn Write) -> io::Result<()> {
        let words: Vec<u32> = params.iter().map(|v| v.to_bits().to_le()).collect();
        writer.write_all(bytemuck::cast_slice(&words))
    }

    fn decode(&self, reader: &mut dyn Read) -> io::Result<Vec<f32>> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        if bytes.len() % size_of::<f32>() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} bytes is not a whole amount of parameters", bytes.len()),
            ));
        }

        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        Ok(words
            .into_iter()
            .map(|word| f32::from_bits(u32::from_le(word)))
            .collect())
    }
}

/// The file the training progress of `model` is saved to.
pub fn progress_path(model: &Path) -> PathBuf {
    let mut name = OsString::from(model.as_os_str());
    name.push(".progress.json");
    PathBuf::from(name)
}

/// The file an intermediate checkpoint taken after `batches` batches is saved to, i.e.
/// `model.bin` becomes `model.iter<batches>.bin`.
pub fn iteration_path(model: &Path, batches: usize) -> PathBuf {
    labeled_path(model, &batches.to_string())
}

/// Inserts `.iter<label>` between the stem and the extension of `model`.
fn labeled_path(model: &Path, label: &str) -> PathBuf {
    let stem = model.file_stem().unwrap_or_default();

    let mut name = OsString::from(stem);
    name.push(".iter");
    name.push(label);
    if let Some(ext) = model.extension() {
        name.push(".");
        name.push(ext);
    }

    model.with_file_name(name)
}

/// Decides where checkpoints go and writes them with a `ModelCodec`.
///
/// Concurrent saves are serialized, a file is never written by two threads at once.
#[derive(Debug)]
pub struct Checkpointer<C: ModelCodec = RawCodec> {
    codec: C,
    model: PathBuf,
    overwrite: bool,
    writing: Mutex<()>,
}

impl Checkpointer {
    /// Creates a new `Checkpointer` writing raw parameters.
    ///
    /// # Arguments
    /// * `model` - The main checkpoint file.
    /// * `overwrite` - Whether intermediate checkpoints only replace the main file.
    pub fn new<P: Into<PathBuf>>(model: P, overwrite: bool) -> Self {
        Self::with_codec(RawCodec, model, overwrite)
    }
}

impl<C: ModelCodec> Checkpointer<C> {
    pub fn with_codec<P: Into<PathBuf>>(codec: C, model: P, overwrite: bool) -> Self {
        Self {
            codec,
            model: model.into(),
            overwrite,
            writing: Mutex::new(()),
        }
    }

    pub fn model(&self) -> &Path {
        &self.model
    }

    /// Saves `params` to the main checkpoint and, for intermediate saves that don't
    /// overwrite, to an iteration numbered copy too.
    ///
    /// # Arguments
    /// * `params` - The flat parameters.
    /// * `batches` - The amount of batches processed, if known.
    /// * `last` - Whether this is the save at the end of training.
    ///
    /// # Returns
    /// The written files.
    pub fn save(&self, params: &[f32], batches: Option<usize>, last: bool) -> Result<Vec<PathBuf>> {
        let _writing = self.writing.lock();
        let mut written = Vec::with_capacity(2);

        if !self.overwrite && !last {
            let path = match batches {
                Some(batches) => iteration_path(&self.model, batches),
                None => labeled_path(&self.model, "unknown"),
            };
            self.write(params, &path)?;
            written.push(path);
        }

        self.write(params, &self.model)?;
        written.push(self.model.clone());

        info!(params = params.len(), last = last; "saved model to {}", self.model.display());
        Ok(written)
    }

    /// Reads the main checkpoint.
    ///
    /// # Returns
    /// `None` if there is no checkpoint yet.
    pub fn load(&self) -> Result<Option<Vec<f32>>> {
        if !self.model.exists() {
            return Ok(None);
        }

        let mut reader = BufReader::new(File::open(&self.model)?);
        let params = self.codec.decode(&mut reader)?;

        info!(params = params.len(); "loaded model from {}", self.model.display());
        Ok(Some(params))
    }

    fn write(&self, params: &[f32], path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.codec.encode(params, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
