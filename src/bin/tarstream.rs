use std::{
    io::{self, IsTerminal, Read, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustix::process::{getgid, getuid};

use tarstream::{
    ArchiveOptions, Compression, Entry, Format, IdentityResolver, SystemIdentity, TarWriter,
};

/// Write tar archives, optionally LZ4 compressed
#[derive(Debug, Parser)]
#[clap(name = "tarstream", version)]
pub struct App {
    /// Create a new archive
    #[clap(short = 'c', long)]
    create: bool,
    /// Extract an archive (not supported)
    #[clap(short = 'x', long)]
    extract: bool,
    /// Write the archive to this file instead of stdout
    #[clap(short = 'f', long = "file")]
    file: Option<PathBuf>,
    /// Wrap the archive in an LZ4 frame
    #[clap(short = 'k', long)]
    lz4: bool,
    /// Header format: unix_v7 or ustar
    #[clap(short = 't', long, default_value = "unix_v7")]
    format: Format,
    /// Name to store the (single) input under
    #[clap(long)]
    rename: Option<String>,
    /// Files and directories to add; stdin is archived if there are none
    inputs: Vec<PathBuf>,
}

fn archive_stdin(tar: &mut TarWriter, name: &str) -> Result<()> {
    let (uid, gid) = (getuid().as_raw(), getgid().as_raw());
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let ids = SystemIdentity;
    let entry = Entry::file(name, 0o777)
        .with_owner(uid, gid)
        .with_owner_names(
            ids.user_name(uid).unwrap_or_default(),
            ids.group_name(gid).unwrap_or_default(),
        )
        .with_mtime(mtime);

    let mut stdin = io::stdin().lock();
    if tar.is_seekable() {
        tar.begin_stream()?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stdin.read(&mut buf).context("reading stdin")?;
            if n == 0 {
                break;
            }
            tar.append_stream(&buf[..n])?;
        }
        tar.complete_stream(entry)?;
    } else {
        // the size has to be known before anything goes out
        let mut data = vec![];
        stdin.read_to_end(&mut data).context("reading stdin")?;
        tar.begin_stream_sized(entry.with_size(data.len() as u64))?;
        tar.append_stream(&data)?;
        tar.end_stream()?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    if args.extract {
        bail!("Unpacking archives is not supported yet");
    }
    if !args.create {
        bail!("Nothing to do: pass -c to create an archive");
    }
    if args.rename.is_some() && args.inputs.len() > 1 {
        bail!("--rename needs exactly one input");
    }
    if args.inputs.is_empty() && io::stdin().is_terminal() {
        bail!("Courageously refusing to create an empty archive");
    }

    let options = ArchiveOptions::default()
        .with_format(args.format)
        .with_compression(if args.lz4 {
            Compression::Lz4
        } else {
            Compression::None
        });

    let mut tar = match &args.file {
        Some(path) => TarWriter::create(path, options)
            .with_context(|| format!("creating archive {}", path.display()))?,
        None => {
            if io::stdout().is_terminal() {
                bail!("Refusing to write archive content to terminal");
            }
            TarWriter::with_callback(
                |block, size| io::stdout().write_all(&block[..size]),
                options,
            )?
        }
    };

    if args.inputs.is_empty() {
        archive_stdin(&mut tar, args.rename.as_deref().unwrap_or("stdin"))?;
    }
    for input in &args.inputs {
        match &args.rename {
            Some(name) => tar.add_from_filesystem_recursive_as(input, name),
            None => tar.add_from_filesystem_recursive(input),
        }
        .with_context(|| format!("adding {}", input.display()))?;
    }

    tar.close()?;
    io::stdout().flush()?;
    Ok(())
}
