//! Settings lookup and resolved container configuration.
//!
//! [`Settings`] is the flat key/value view (defaults, then an optional TOML
//! file, then `BINPKG_*` environment variables). [`GpkgConfig`] is the
//! immutable, validated form every container operation works from.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::Path;
use std::process::Command;
use std::str::Chars;

use gpkg_schema::{Compression, DigestAlgorithm};
use tracing::debug;

use crate::error::{GpkgError, Result};

/// Codec name, or `none`.
pub const KEY_COMPRESS: &str = "BINPKG_COMPRESS";
/// Integer compression level.
pub const KEY_COMPRESS_LEVEL: &str = "BINPKG_COMPRESS_LEVEL";
/// Extra compressor flags.
pub const KEY_COMPRESS_FLAGS: &str = "BINPKG_COMPRESS_FLAGS";
/// Digest algorithm list.
pub const KEY_CHECKSUMS: &str = "BINPKG_CHECKSUMS";
/// Detached signer command line.
pub const KEY_SIGNING_COMMAND: &str = "BINPKG_GPG_SIGNING_COMMAND";
/// Detached signature verifier command line.
pub const KEY_VERIFY_COMMAND: &str = "BINPKG_GPG_VERIFY_COMMAND";
/// Optional passphrase-cache unlock command.
pub const KEY_UNLOCK_COMMAND: &str = "BINPKG_GPG_UNLOCK_COMMAND";
/// Create signatures on write.
pub const KEY_CREATE_SIGNING: &str = "BINPKG_CREATE_SIGNING";
/// Require signatures on read.
pub const KEY_REQUEST_SIGNING: &str = "BINPKG_REQUEST_SIGNING";
/// Verify signatures on read (`false` skips verification).
pub const KEY_VERIFY_SIGNING: &str = "BINPKG_VERIFY_SIGNING";
/// Accept inner entries under a different base directory.
pub const KEY_ALLOW_BASENAME_MISMATCH: &str = "BINPKG_ALLOW_BASENAME_MISMATCH";
/// Space separated feature tokens.
pub const KEY_FEATURES: &str = "FEATURES";

/// Token in the verify command replaced by the detached signature path.
pub const SIGNATURE_PLACEHOLDER: &str = "[SIGNATURE]";

const DEFAULT_COMPRESS: &str = "zstd";
const DEFAULT_CHECKSUMS: &str = "SHA512 BLAKE3";
const DEFAULT_SIGNING_COMMAND: &str =
    "gpg --detach-sig --armor --batch --no-tty --yes --digest-algo SHA256";
const DEFAULT_VERIFY_COMMAND: &str =
    "gpg --verify --batch --no-tty --no-auto-check-trustdb --status-fd 2 [SIGNATURE] -";

const ENV_PREFIX: &str = "BINPKG_";

/// Flat key/value settings lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert(KEY_COMPRESS.to_string(), DEFAULT_COMPRESS.to_string());
        values.insert(KEY_CHECKSUMS.to_string(), DEFAULT_CHECKSUMS.to_string());
        values.insert(
            KEY_SIGNING_COMMAND.to_string(),
            DEFAULT_SIGNING_COMMAND.to_string(),
        );
        values.insert(
            KEY_VERIFY_COMMAND.to_string(),
            DEFAULT_VERIFY_COMMAND.to_string(),
        );
        Self { values }
    }
}

impl Settings {
    /// Settings with no keys at all, not even defaults.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Defaults overridden by `BINPKG_*` and `FEATURES` from the process environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.merge_vars(std::env::vars());
        settings
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Merge `BINPKG_*` and `FEATURES` pairs; other names are ignored.
    pub fn merge_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.into();
            if key.starts_with(ENV_PREFIX) || key == KEY_FEATURES {
                self.values.insert(key, value.into());
            }
        }
    }

    /// Merge a TOML settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid settings TOML.
    pub fn load_toml_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.merge_toml(&text)
            .map_err(|e| GpkgError::Config(format!("{}: {e}", path.display())))
    }

    /// Merge top-level TOML values.
    ///
    /// Strings, integers and booleans are stored as text. An array is stored
    /// as a shell-quoted command line so it splits back into the same argv.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::Config`] on a parse error or a nested table.
    pub fn merge_toml(&mut self, text: &str) -> Result<()> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| GpkgError::Config(e.to_string()))?;

        for (key, value) in table {
            let text = match value {
                toml::Value::Array(items) => items
                    .into_iter()
                    .map(|item| scalar_to_string(&key, item).map(|s| shell_quote(&s)))
                    .collect::<Result<Vec<_>>>()?
                    .join(" "),
                other => scalar_to_string(&key, other)?,
            };
            self.values.insert(key, text);
        }
        Ok(())
    }
}

fn scalar_to_string(key: &str, value: toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(GpkgError::Config(format!(
            "{key}: expected a string, integer, boolean or array of those"
        ))),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Signature policy flags. See [`TrustPolicy::should_verify`] for how they compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustPolicy {
    /// Sign entries and the Manifest on write.
    pub create: bool,
    /// Refuse containers without signatures on read.
    pub require: bool,
    /// Never verify signatures (explicit user override).
    pub skip: bool,
}

impl TrustPolicy {
    /// Whether signatures must be verified, given whether any signature
    /// entry exists in the container.
    pub fn should_verify(&self, signature_observed: bool) -> bool {
        !self.skip && (self.require || signature_observed)
    }
}

/// How an entry's bytes pass through a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecCommand {
    /// Bytes are stored as-is.
    Passthrough,
    /// Bytes are piped through an external program (argv, program first).
    External(Vec<String>),
}

/// Signer behaviour attached to a checksum stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignMode {
    /// Digests only.
    None,
    /// Produce a detached signature with this argv.
    Sign(Vec<String>),
    /// Check a detached signature with this argv.
    Verify {
        /// Verifier argv; [`SIGNATURE_PLACEHOLDER`] is replaced by the signature path.
        command: Vec<String>,
        /// The detached signature bytes.
        signature: Vec<u8>,
    },
}

/// Validated configuration for container operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpkgConfig {
    /// Codec for newly written sub-archives; `None` stores plain `.tar`.
    pub compression: Option<Compression>,
    /// Compression level passed as `-N`.
    pub level: u32,
    /// Extra compressor arguments.
    pub extra_flags: Vec<String>,
    /// Digest algorithms computed over every entry.
    pub checksums: Vec<DigestAlgorithm>,
    /// Detached signer argv.
    pub signing_command: Vec<String>,
    /// Detached signature verifier argv.
    pub verify_command: Vec<String>,
    /// Optional unlock argv run before signing builds.
    pub unlock_command: Option<Vec<String>>,
    /// Signature policy.
    pub trust: TrustPolicy,
    /// Accept inner entries found under a different base directory.
    pub allow_basename_mismatch: bool,
}

impl Default for GpkgConfig {
    fn default() -> Self {
        Self {
            compression: Some(Compression::Zstd),
            level: Compression::Zstd.default_level(),
            extra_flags: Vec::new(),
            checksums: vec![DigestAlgorithm::Sha512, DigestAlgorithm::Blake3],
            signing_command: DEFAULT_SIGNING_COMMAND
                .split_whitespace()
                .map(String::from)
                .collect(),
            verify_command: DEFAULT_VERIFY_COMMAND
                .split_whitespace()
                .map(String::from)
                .collect(),
            unlock_command: None,
            trust: TrustPolicy::default(),
            allow_basename_mismatch: false,
        }
    }
}

impl GpkgConfig {
    /// Resolve settings once into a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::UnsupportedCodec`] for an unknown codec name and
    /// [`GpkgError::Config`] for malformed booleans, checksum lists or
    /// command lines.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let compression = match settings.get(KEY_COMPRESS).map(str::trim) {
            None | Some("" | "none") => None,
            Some(name) => Some(
                name.parse::<Compression>()
                    .map_err(|e| GpkgError::UnsupportedCodec(e.0))?,
            ),
        };

        let level = settings
            .get(KEY_COMPRESS_LEVEL)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| compression.map_or(9, Compression::default_level));

        let extra_flags = split_command(settings.get(KEY_COMPRESS_FLAGS).unwrap_or(""), settings)?;

        let checksums = settings
            .get(KEY_CHECKSUMS)
            .unwrap_or(DEFAULT_CHECKSUMS)
            .split_whitespace()
            .map(|name| {
                name.parse::<DigestAlgorithm>()
                    .map_err(|e| GpkgError::Config(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        if checksums.is_empty() {
            return Err(GpkgError::Config(format!("{KEY_CHECKSUMS} is empty")));
        }

        let signing_command = split_command(
            settings
                .get(KEY_SIGNING_COMMAND)
                .unwrap_or(DEFAULT_SIGNING_COMMAND),
            settings,
        )?;
        let verify_command = split_command(
            settings
                .get(KEY_VERIFY_COMMAND)
                .unwrap_or(DEFAULT_VERIFY_COMMAND),
            settings,
        )?;
        let unlock_command = match settings.get(KEY_UNLOCK_COMMAND) {
            Some(cmd) if !cmd.trim().is_empty() => Some(split_command(cmd, settings)?),
            _ => None,
        };

        let mut trust = TrustPolicy {
            create: parse_bool(settings, KEY_CREATE_SIGNING, false)?,
            require: parse_bool(settings, KEY_REQUEST_SIGNING, false)?,
            skip: !parse_bool(settings, KEY_VERIFY_SIGNING, true)?,
        };
        for token in settings.get(KEY_FEATURES).unwrap_or("").split_whitespace() {
            let (enabled, name) = match token.strip_prefix('-') {
                Some(name) => (false, name),
                None => (true, token),
            };
            match name {
                "binpkg-signing" => trust.create = enabled,
                "binpkg-request-signature" => trust.require = enabled,
                "binpkg-ignore-signature" => trust.skip = enabled,
                _ => {}
            }
        }

        let allow_basename_mismatch = parse_bool(settings, KEY_ALLOW_BASENAME_MISMATCH, false)?;

        for (name, cmd) in [
            (KEY_SIGNING_COMMAND, &signing_command),
            (KEY_VERIFY_COMMAND, &verify_command),
        ] {
            if cmd.is_empty() {
                return Err(GpkgError::Config(format!("{name} is empty")));
            }
        }

        Ok(Self {
            compression,
            level,
            extra_flags,
            checksums,
            signing_command,
            verify_command,
            unlock_command,
            trust,
            allow_basename_mismatch,
        })
    }

    /// Compressor for newly written sub-archives.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::UnsupportedCodec`] if the codec binary is not on `PATH`.
    pub fn compressor(&self) -> Result<CodecCommand> {
        match self.compression {
            None => Ok(CodecCommand::Passthrough),
            Some(codec) => {
                let mut args = codec.compress_args(self.level);
                args.extend(self.extra_flags.iter().cloned());
                external_command(codec, args)
            }
        }
    }

    /// Decompressor for an entry written with `compression`.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::UnsupportedCodec`] if the codec binary is not on `PATH`.
    pub fn decompressor(&self, compression: Option<Compression>) -> Result<CodecCommand> {
        match compression {
            None => Ok(CodecCommand::Passthrough),
            Some(codec) => external_command(codec, codec.decompress_args()),
        }
    }

    /// Signer mode for entries written under this configuration.
    pub fn sign_mode(&self) -> SignMode {
        if self.trust.create {
            SignMode::Sign(self.signing_command.clone())
        } else {
            SignMode::None
        }
    }

    /// Verifier mode for a detached signature.
    pub fn verify_mode(&self, signature: Vec<u8>) -> SignMode {
        SignMode::Verify {
            command: self.verify_command.clone(),
            signature,
        }
    }

    /// Run the unlock command, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::Signing`] if the command cannot start or exits non-success.
    pub fn unlock(&self) -> Result<()> {
        let Some(argv) = &self.unlock_command else {
            return Ok(());
        };
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };

        debug!(command = %program, "Running signing unlock command");
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| GpkgError::Signing(format!("{program}: {e}")))?;
        if !status.success() {
            return Err(GpkgError::Signing(format!(
                "unlock command {program} exited with {status}"
            )));
        }
        Ok(())
    }
}

fn external_command(codec: Compression, args: Vec<String>) -> Result<CodecCommand> {
    let binary = codec.binary();
    which::which(binary)
        .map_err(|_| GpkgError::UnsupportedCodec(format!("{binary} not found in PATH")))?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(binary.to_string());
    argv.extend(args);
    Ok(CodecCommand::External(argv))
}

fn parse_bool(settings: &Settings, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = settings.get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" | "" => Ok(false),
        other => Err(GpkgError::Config(format!("Invalid {key} flag: {other}"))),
    }
}

/// Split a command line into argv, expanding `$VAR` and `${VAR}` from `vars`.
///
/// Single quotes suppress expansion, double quotes keep it, backslash escapes
/// the next character. Unquoted expansions are split on whitespace.
///
/// # Errors
///
/// Returns [`GpkgError::Config`] on an unterminated quote or `${`.
pub fn split_command(input: &str, vars: &Settings) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(input, "single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated(input, "double quote")),
                        },
                        Some('$') => current.push_str(&expand_var(&mut chars, vars, input)?),
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(input, "double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            '$' => {
                for ch in expand_var(&mut chars, vars, input)?.chars() {
                    if ch.is_whitespace() {
                        if in_word {
                            args.push(std::mem::take(&mut current));
                            in_word = false;
                        }
                    } else {
                        current.push(ch);
                        in_word = true;
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        args.push(current);
    }
    Ok(args)
}

fn expand_var(chars: &mut Peekable<Chars<'_>>, vars: &Settings, input: &str) -> Result<String> {
    let mut name = String::new();
    match chars.peek() {
        Some('{') => {
            chars.next();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(ch) => name.push(ch),
                    None => return Err(unterminated(input, "${")),
                }
            }
        }
        Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_alphanumeric() || ch == '_' {
                    name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        _ => return Ok("$".to_string()),
    }
    Ok(vars.get(&name).unwrap_or_default().to_string())
}

fn unterminated(input: &str, what: &str) -> GpkgError {
    GpkgError::Config(format!("unterminated {what} in command: {input}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let mut s = Settings::default();
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn defaults_resolve() {
        let config = GpkgConfig::from_settings(&Settings::default()).unwrap();
        assert_eq!(config.compression, Some(Compression::Zstd));
        assert_eq!(config.level, 3);
        assert_eq!(
            config.checksums,
            vec![DigestAlgorithm::Sha512, DigestAlgorithm::Blake3]
        );
        assert_eq!(config.trust, TrustPolicy::default());
        assert!(config.verify_command.contains(&SIGNATURE_PLACEHOLDER.to_string()));
        assert_eq!(config, GpkgConfig::default());
    }

    #[test]
    fn unknown_codec_is_unsupported() {
        let err = GpkgConfig::from_settings(&settings(&[(KEY_COMPRESS, "rar")])).unwrap_err();
        assert!(matches!(err, GpkgError::UnsupportedCodec(_)));
    }

    #[test]
    fn none_codec_is_passthrough() {
        let config = GpkgConfig::from_settings(&settings(&[(KEY_COMPRESS, "none")])).unwrap();
        assert_eq!(config.compression, None);
        assert_eq!(config.compressor().unwrap(), CodecCommand::Passthrough);
        assert_eq!(config.decompressor(None).unwrap(), CodecCommand::Passthrough);
    }

    #[test]
    fn level_falls_back_on_garbage() {
        let config = GpkgConfig::from_settings(&settings(&[
            (KEY_COMPRESS, "xz"),
            (KEY_COMPRESS_LEVEL, "fast"),
        ]))
        .unwrap();
        assert_eq!(config.level, 9);

        let config = GpkgConfig::from_settings(&settings(&[
            (KEY_COMPRESS, "xz"),
            (KEY_COMPRESS_LEVEL, "2"),
        ]))
        .unwrap();
        assert_eq!(config.level, 2);
    }

    #[test]
    fn invalid_boolean_is_config_error() {
        let err = GpkgConfig::from_settings(&settings(&[(KEY_CREATE_SIGNING, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, GpkgError::Config(msg) if msg.contains(KEY_CREATE_SIGNING)));
    }

    #[test]
    fn features_override_flags() {
        let config = GpkgConfig::from_settings(&settings(&[
            (KEY_REQUEST_SIGNING, "1"),
            (
                KEY_FEATURES,
                "binpkg-signing -binpkg-request-signature binpkg-ignore-signature",
            ),
        ]))
        .unwrap();
        assert!(config.trust.create);
        assert!(!config.trust.require);
        assert!(config.trust.skip);
    }

    #[test]
    fn trust_policy_composition() {
        let lax = TrustPolicy::default();
        assert!(!lax.should_verify(false));
        assert!(lax.should_verify(true));

        let strict = TrustPolicy {
            require: true,
            ..TrustPolicy::default()
        };
        assert!(strict.should_verify(false));

        let skip = TrustPolicy {
            require: true,
            skip: true,
            ..TrustPolicy::default()
        };
        assert!(!skip.should_verify(true));
    }

    #[test]
    fn split_handles_quotes_and_vars() {
        let vars = settings(&[("BINPKG_KEY", "ABCD 1234"), ("HOME_DIR", "/home/u")]);
        let argv = split_command(
            r#"gpg --local-user "${BINPKG_KEY}" --homedir $HOME_DIR '$literal' a\ b"#,
            &vars,
        )
        .unwrap();
        assert_eq!(
            argv,
            [
                "gpg",
                "--local-user",
                "ABCD 1234",
                "--homedir",
                "/home/u",
                "$literal",
                "a b"
            ]
        );
    }

    #[test]
    fn unquoted_expansion_splits() {
        let vars = settings(&[("BINPKG_BASE", "gpg --batch")]);
        let argv = split_command("${BINPKG_BASE} --verify", &vars).unwrap();
        assert_eq!(argv, ["gpg", "--batch", "--verify"]);
    }

    #[test]
    fn split_rejects_unterminated_quote() {
        assert!(split_command("gpg 'oops", &Settings::empty()).is_err());
        assert!(split_command("gpg ${OOPS", &Settings::empty()).is_err());
    }

    #[test]
    fn toml_arrays_keep_argv() {
        let mut s = Settings::default();
        s.merge_toml(
            r#"
            BINPKG_COMPRESS = "gzip"
            BINPKG_COMPRESS_LEVEL = 6
            BINPKG_CREATE_SIGNING = true
            BINPKG_GPG_SIGNING_COMMAND = ["sh", "-c", "printf 'sig'; cat >/dev/null"]
            "#,
        )
        .unwrap();
        assert_eq!(s.get(KEY_COMPRESS_LEVEL), Some("6"));

        let config = GpkgConfig::from_settings(&s).unwrap();
        assert_eq!(config.compression, Some(Compression::Gzip));
        assert_eq!(config.level, 6);
        assert!(config.trust.create);
        assert_eq!(
            config.signing_command,
            ["sh", "-c", "printf 'sig'; cat >/dev/null"]
        );
    }

    #[test]
    fn toml_rejects_tables() {
        let mut s = Settings::default();
        assert!(s.merge_toml("[nested]\nkey = 1\n").is_err());
    }

    #[test]
    fn env_merge_filters_names() {
        let mut s = Settings::empty();
        s.merge_vars([
            ("BINPKG_COMPRESS", "xz"),
            ("FEATURES", "binpkg-signing"),
            ("PATH", "/bin"),
        ]);
        assert_eq!(s.get("BINPKG_COMPRESS"), Some("xz"));
        assert_eq!(s.get("FEATURES"), Some("binpkg-signing"));
        assert_eq!(s.get("PATH"), None);
    }
}
