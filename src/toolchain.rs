//! Toolchain lookup and target resolution.
//!
//! The toolchain is treated as an opaque command: rerun only knows how to ask
//! it where a target lives, how to invoke its test/build/install verbs, and
//! where installed binaries end up.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

use crate::error::SetupError;

/// Default toolchain command.
pub const DEFAULT_TOOLCHAIN: &str = "go";

const LIST_FORMAT: &str = "{{.Name}}\t{{.Dir}}\t{{.Goroot}}\t{{.Target}}";

/// One step of the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Test,
    Build,
    Install,
}

impl Stage {
    /// The toolchain verb for this stage.
    pub fn verb(self) -> &'static str {
        match self {
            Stage::Test => "test",
            Stage::Build => "build",
            Stage::Install => "install",
        }
    }

    fn verbose(self) -> bool {
        !matches!(self, Stage::Install)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, OsString)>,
}

impl Invocation {
    /// Builds a `tokio` command for this invocation.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Renders the command line for display.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.program.to_string_lossy().to_string());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Kind of unit a target resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageKind {
    /// Produces an executable.
    Command,
    /// Anything else, with the package name the toolchain reported.
    Library(String),
}

/// A target after the toolchain has located it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The identifier as given on the command line.
    pub target: String,
    /// Source directory of the target.
    pub dir: PathBuf,
    pub kind: PackageKind,
    /// Install location reported by the toolchain, if it gave one.
    pub installed: Option<PathBuf>,
}

impl ResolvedTarget {
    /// Name of the binary the install stage produces.
    pub fn binary_name(&self) -> String {
        if let Some(name) = self.installed.as_deref().and_then(Path::file_name) {
            return name.to_string_lossy().to_string();
        }
        let trimmed = self.target.trim_end_matches('/');
        let stem = match Path::new(trimmed).file_name() {
            Some(name) if !trimmed.is_empty() => name.to_string_lossy().to_string(),
            _ => self
                .dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| trimmed.to_string()),
        };
        format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
    }
}

/// The located toolchain command.
#[derive(Debug, Clone)]
pub struct Toolchain {
    program: PathBuf,
    root: Option<PathBuf>,
}

impl Toolchain {
    /// Locates `command`, optionally inside an alternate installation root.
    ///
    /// With a root the command is `<root>/bin/<command>` and every call gets
    /// `GOROOT=<root>`. The root must be an existing directory.
    pub fn locate(command: &str, root: Option<&Path>) -> Result<Self, SetupError> {
        match root {
            Some(root) => {
                if !root.is_dir() {
                    return Err(SetupError::InvalidToolchainRoot(root.to_path_buf()));
                }
                Ok(Self {
                    program: root.join("bin").join(command),
                    root: Some(root.to_path_buf()),
                })
            }
            None => Ok(Self {
                program: PathBuf::from(command),
                root: None,
            }),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Invocation for an arbitrary toolchain subcommand.
    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let env = self
            .root
            .iter()
            .map(|root| ("GOROOT".to_string(), root.clone().into_os_string()))
            .collect();
        Invocation {
            program: self.program.clone(),
            args: args.into_iter().map(Into::into).collect(),
            env,
        }
    }

    /// `<toolchain> <verb> [-race] [-v] <target>`
    pub fn stage_invocation(&self, stage: Stage, race: bool, target: &str) -> Invocation {
        let mut args = vec![stage.verb().to_string()];
        if race {
            args.push("-race".to_string());
        }
        if stage.verbose() {
            args.push("-v".to_string());
        }
        args.push(target.to_string());
        self.invocation(args)
    }

    /// Asks the toolchain where `target` lives and what kind of unit it is.
    pub async fn resolve(&self, target: &str) -> Result<ResolvedTarget, SetupError> {
        let to_error = |message: String| SetupError::Resolution {
            target: target.to_string(),
            message,
        };
        let stdout = self
            .query(&["list", "-f", LIST_FORMAT, target])
            .await
            .map_err(|err| to_error(format!("{:#}", err)))?;
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| to_error("toolchain returned no package".to_string()))?;
        let listed = parse_list_line(line).map_err(|err| to_error(err.to_string()))?;
        if listed.goroot {
            return Err(SetupError::StandardLibrary {
                target: target.to_string(),
            });
        }
        let kind = if listed.name == "main" {
            PackageKind::Command
        } else {
            PackageKind::Library(listed.name)
        };
        Ok(ResolvedTarget {
            target: target.to_string(),
            dir: listed.dir,
            kind,
            installed: listed.installed,
        })
    }

    /// Path of the installed binary for `target`.
    ///
    /// The location the toolchain reported wins. Without one, `$GOBIN` when
    /// set, otherwise the default bin directory under the first `GOPATH` entry.
    pub async fn binary_path(&self, target: &ResolvedTarget) -> Result<PathBuf> {
        if let Some(installed) = &target.installed {
            return Ok(installed.clone());
        }
        let gobin = std::env::var_os("GOBIN").filter(|value| !value.is_empty());
        let bin_dir = match gobin {
            Some(dir) => PathBuf::from(dir),
            None => {
                let gopath = self.query(&["env", "GOPATH"]).await?;
                default_bin_dir(&gopath)?
            }
        };
        Ok(bin_dir.join(target.binary_name()))
    }

    async fn query(&self, args: &[&str]) -> Result<String> {
        let invocation = self.invocation(args.iter().copied());
        let output = invocation
            .command()
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", invocation.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{}", stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

struct ListedPackage {
    name: String,
    dir: PathBuf,
    goroot: bool,
    installed: Option<PathBuf>,
}

fn parse_list_line(line: &str) -> Result<ListedPackage> {
    let mut fields = line.trim_end_matches(|c: char| c == '\r' || c == '\n').splitn(4, '\t');
    let (Some(name), Some(dir), Some(goroot)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(anyhow!("unexpected package description {:?}", line));
    };
    if name.is_empty() || dir.is_empty() {
        return Err(anyhow!("unexpected package description {:?}", line));
    }
    let installed = fields
        .next()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    Ok(ListedPackage {
        name: name.to_string(),
        dir: PathBuf::from(dir),
        goroot: goroot.trim() == "true",
        installed,
    })
}

fn default_bin_dir(gopath: &str) -> Result<PathBuf> {
    let first = std::env::split_paths(gopath.trim())
        .find(|path| !path.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("GOPATH is empty and GOBIN is not set"))?;
    Ok(first.join("bin"))
}
