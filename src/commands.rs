/// The four user operations, glued from the key-file, envelope, and agent
/// layers. All options travel in an explicit [`Context`]; nothing here is
/// process-global.
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cleanup::CleanupGuard;
use crate::config;
use crate::crypto::envelope;
use crate::crypto::keys::SecretKey;
use crate::error::{EnchiveError, Result};
use crate::keyfile::{self, SecretKeyFile};
use crate::passphrase::PassphraseProvider;

/// Options shared by every command.
pub struct Context {
    /// Public key file override; the config directory's by default.
    pub pubkey: Option<PathBuf>,
    /// Secret key file override; the config directory's by default.
    pub seckey: Option<PathBuf>,
    /// Agent inactivity timeout in seconds; 0 disables key caching.
    pub agent_timeout: u32,
}

impl Context {
    fn public_key_file(&self) -> Result<PathBuf> {
        match &self.pubkey {
            Some(path) => Ok(path.clone()),
            None => config::default_public_key_file(),
        }
    }

    fn secret_key_file(&self) -> Result<PathBuf> {
        match &self.seckey {
            Some(path) => Ok(path.clone()),
            None => config::default_secret_key_file(),
        }
    }
}

pub struct KeygenOptions {
    /// Derive the secret key from a passphrase with this cost exponent.
    pub derive: Option<u8>,
    /// Rewrap an existing secret key instead of generating one.
    pub edit: bool,
    /// Overwrite existing key files.
    pub force: bool,
    /// Also print the public key fingerprint.
    pub fingerprint: bool,
    /// Protection-key cost exponent.
    pub iterations: u8,
    /// Store the secret key without passphrase protection.
    pub plain: bool,
}

pub struct StreamOptions {
    pub infile: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    /// Remove the input file on success.
    pub delete: bool,
}

/// Create (or with `--edit`, rewrap) the key pair.
pub fn keygen(
    ctx: &Context,
    opts: &KeygenOptions,
    provider: &mut dyn PassphraseProvider,
) -> Result<()> {
    if opts.edit && opts.derive.is_some() {
        return Err(EnchiveError::BadArgument(
            "--edit and --derive are mutually exclusive".into(),
        ));
    }

    let pubfile = ctx.public_key_file()?;
    let secfile = ctx.secret_key_file()?;

    if !opts.edit && !opts.force {
        if pubfile.exists() {
            return Err(EnchiveError::Clobber(pubfile));
        }
        if secfile.exists() {
            return Err(EnchiveError::Clobber(secfile));
        }
    }

    let secret = if opts.edit {
        if !secfile.exists() {
            return Err(EnchiveError::NotFound(format!(
                "cannot edit non-existing file {}",
                secfile.display()
            )));
        }
        keyfile::load_secret_key(&secfile, provider, ctx.agent_timeout)?
    } else if let Some(iexp) = opts.derive {
        let pass = provider.read_passphrase("secret key passphrase: ")?;
        let repeat = provider.read_passphrase("secret key passphrase (repeat): ")?;
        if pass != repeat {
            return Err(EnchiveError::PassphraseMismatch);
        }
        SecretKey::from_passphrase(&pass, iexp)?
    } else {
        SecretKey::generate()
    };

    let public = secret.public_key();
    if opts.fingerprint {
        println!("keyid: {}", public.fingerprint());
    }

    // An empty passphrase downgrades to an unprotected key.
    let contents = if opts.plain {
        SecretKeyFile::plain(&secret)
    } else {
        let pass = provider.read_passphrase("passphrase (empty for none): ")?;
        if pass.is_empty() {
            SecretKeyFile::plain(&secret)
        } else {
            let repeat = provider.read_passphrase("passphrase (repeat): ")?;
            if pass != repeat {
                return Err(EnchiveError::PassphraseMismatch);
            }
            SecretKeyFile::protect(&secret, &pass, opts.iterations)?
        }
    };

    // Neither file survives unless both are written.
    let sec_guard = CleanupGuard::arm(&secfile);
    keyfile::write_secret_key(&secfile, &contents)?;
    let pub_guard = CleanupGuard::arm(&pubfile);
    keyfile::write_public_key(&pubfile, &public)?;
    sec_guard.commit();
    pub_guard.commit();
    Ok(())
}

/// Print the public key fingerprint.
pub fn fingerprint(ctx: &Context) -> Result<()> {
    let public = keyfile::read_public_key(&ctx.public_key_file()?)?;
    println!("{}", public.fingerprint());
    Ok(())
}

/// Encrypt a file (or stdin) to the public key.
pub fn archive(ctx: &Context, opts: &StreamOptions) -> Result<()> {
    let public = keyfile::read_public_key(&ctx.public_key_file()?)?;

    let outfile = match (&opts.outfile, &opts.infile) {
        (Some(outfile), _) => Some(outfile.clone()),
        (None, Some(infile)) => Some(archive_name(infile)),
        (None, None) => None,
    };

    let mut input = open_input(&opts.infile)?;
    let (mut output, guard) = open_output(&outfile)?;

    envelope::encrypt(&mut input, &mut output, &public)?;
    output.flush()?;
    drop(output);

    if let Some(guard) = guard {
        guard.commit();
    }
    delete_input(opts);
    Ok(())
}

/// Decrypt an archive (or stdin) with the secret key.
pub fn extract(
    ctx: &Context,
    opts: &StreamOptions,
    provider: &mut dyn PassphraseProvider,
) -> Result<()> {
    // Unlock the key first so any prompt precedes archive I/O.
    let secret = keyfile::load_secret_key(&ctx.secret_key_file()?, provider, ctx.agent_timeout)?;

    let outfile = match (&opts.outfile, &opts.infile) {
        (Some(outfile), _) => Some(outfile.clone()),
        (None, Some(infile)) => Some(extract_name(infile)?),
        (None, None) => None,
    };

    let mut input = open_input(&opts.infile)?;
    let (mut output, guard) = open_output(&outfile)?;

    // The guard holds the output provisional: a checksum mismatch (or any
    // other failure) unlinks whatever was already written.
    envelope::decrypt(&mut input, &mut output, &secret)?;
    output.flush()?;
    drop(output);

    if let Some(guard) = guard {
        guard.commit();
    }
    delete_input(opts);
    Ok(())
}

fn archive_name(infile: &Path) -> PathBuf {
    let mut name = infile.as_os_str().to_os_string();
    name.push(config::ARCHIVE_SUFFIX);
    PathBuf::from(name)
}

fn extract_name(infile: &Path) -> Result<PathBuf> {
    let name = infile.to_string_lossy();
    match name.strip_suffix(config::ARCHIVE_SUFFIX) {
        Some(stem) if !stem.is_empty() => Ok(PathBuf::from(stem.to_string())),
        _ => Err(EnchiveError::BadArgument(format!(
            "could not determine output filename from {name}"
        ))),
    }
}

fn open_input(path: &Option<PathBuf>) -> Result<Box<dyn Read>> {
    match path {
        Some(path) => {
            let file = File::open(path).map_err(|e| EnchiveError::Open {
                path: path.clone(),
                source: e,
            })?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdin().lock())),
    }
}

fn open_output(path: &Option<PathBuf>) -> Result<(Box<dyn Write>, Option<CleanupGuard>)> {
    match path {
        Some(path) => {
            let file = keyfile::create_private(path)?;
            let guard = CleanupGuard::arm(path);
            Ok((Box::new(file), Some(guard)))
        }
        None => Ok((Box::new(io::stdout().lock()), None)),
    }
}

fn delete_input(opts: &StreamOptions) {
    if opts.delete {
        if let Some(infile) = &opts.infile {
            if let Err(e) = fs::remove_file(infile) {
                warn!("could not remove {}: {e}", infile.display());
            }
        }
    }
}
