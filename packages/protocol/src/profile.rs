//! Stored profiles (`AT&W`, `AT&Y`, `ATZ`)
//!
//! Two snapshots of the live [`Config`] and [`Registers`], plus the index of
//! the one loaded at power-up. The record is kept as pretty JSON so it can
//! be inspected and edited by hand.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{config::Config, registers::Registers};

pub const PROFILE_COUNT: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub config: Config,
    pub registers: Registers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProfiles {
    pub power_up_config: usize,
    pub profiles: [Profile; PROFILE_COUNT],
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for StoredProfiles {
    fn default() -> Self {
        Self {
            power_up_config: 0,
            profiles: Default::default(),
            path: None,
        }
    }
}

impl StoredProfiles {
    /// Profiles backed by `path`. A missing file yields factory profiles.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No stored profiles at {path:?}, using factory defaults");
            return Ok(Self::factory(Some(path.to_path_buf())));
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read profiles from {path:?}"))?;
        let mut profiles: StoredProfiles =
            serde_json::from_str(&json).context("Failed to deserialize stored profiles")?;
        if profiles.power_up_config >= PROFILE_COUNT {
            bail!(
                "power-up profile {} out of range in {path:?}",
                profiles.power_up_config
            );
        }
        profiles.path = Some(path.to_path_buf());
        log::info!("Loaded stored profiles from {path:?}");
        Ok(profiles)
    }

    /// Factory profiles, optionally bound to a file for later saves.
    pub fn factory(path: Option<PathBuf>) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize stored profiles")?;
        fs::write(path, json).with_context(|| format!("Failed to write profiles to {path:?}"))?;
        log::debug!("Saved stored profiles to {path:?}");
        Ok(())
    }

    /// Rebuild both slots from hard-coded defaults.
    pub fn factory_reset(&mut self) {
        self.power_up_config = 0;
        self.profiles = Default::default();
    }

    pub fn get(&self, slot: usize) -> Result<&Profile> {
        match self.profiles.get(slot) {
            Some(profile) => Ok(profile),
            None => bail!("profile {slot} does not exist"),
        }
    }

    /// `AT&Wn`: snapshot the live settings into a slot and persist.
    pub fn store(&mut self, slot: usize, config: &Config, registers: &Registers) -> Result<()> {
        let Some(profile) = self.profiles.get_mut(slot) else {
            bail!("profile {slot} does not exist");
        };
        profile.config = config.clone();
        profile.registers = registers.clone();
        self.save()
    }

    /// `AT&Yn`: select the power-up slot and persist.
    pub fn set_power_up(&mut self, slot: usize) -> Result<()> {
        if slot >= PROFILE_COUNT {
            bail!("profile {slot} does not exist");
        }
        self.power_up_config = slot;
        self.save()
    }
}
