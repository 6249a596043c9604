//! Boundary to the external package installer

use crate::{command, errors::Error, manifest::PackageSpec};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Installs package contents into a directory
///
/// The root cache depends only on this contract, not on any package format.
pub trait PackageInstaller: Send + Sync {
    /// Install every package into `root`, which already exists and is empty
    fn install(&self, packages: &[PackageSpec], root: &Path) -> Result<(), Error>;

    /// Total bytes the packages occupy once installed
    fn installed_size(&self, packages: &[PackageSpec]) -> Result<u64, Error>;
}

/// Installer backed by an external program
///
/// Invoked as `<program> <args..> install --root <dir> <package>..` and
/// `<program> <args..> size <package>..`, the latter printing a byte count.
#[derive(Clone, Debug)]
pub struct CommandInstaller {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        CommandInstaller {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    fn invoke(&self, extra: Vec<OsString>, packages: &[PackageSpec]) -> Result<String, Error> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.extend(extra);
        args.extend(packages.iter().map(|spec| OsString::from(spec.to_string())));
        command::run(&self.program.to_string_lossy(), &args)
            .map_err(|err| Error::Installer(err.to_string()))
    }
}

impl PackageInstaller for CommandInstaller {
    fn install(&self, packages: &[PackageSpec], root: &Path) -> Result<(), Error> {
        self.invoke(
            vec!["install".into(), "--root".into(), root.as_os_str().to_owned()],
            packages,
        )?;
        Ok(())
    }

    fn installed_size(&self, packages: &[PackageSpec]) -> Result<u64, Error> {
        let out = self.invoke(vec!["size".into()], packages)?;
        out.trim()
            .parse()
            .map_err(|_| Error::Installer(format!("unexpected size output {:?}", out)))
    }
}
