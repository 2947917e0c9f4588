//! Firmware releases published by a project
//!
//! Listing and downloading releases is left to a [ReleaseSource]; a session
//! only needs the bytes of one asset, see
//! [Firmware::from_release](crate::flash_data::Firmware::from_release).

use std::io::Read;

use serde::Deserialize;

use crate::Error;

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Asset {
    /// Whether the asset is a raw image that can be flashed as-is
    pub fn is_binary(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".bin")
    }
}

/// A published release, newest first when listed by a [ReleaseSource]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    #[serde(rename = "name")]
    pub title: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Release {
    /// Assets of this release that can be flashed
    pub fn binary_assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.iter().filter(|asset| asset.is_binary())
    }
}

/// Where releases come from
pub trait ReleaseSource {
    /// All releases, in the order they should be presented
    fn list_releases(&self) -> Result<Vec<Release>, Error>;

    /// Open a stream of the asset's bytes
    fn download_asset(&self, asset: &Asset) -> Result<Box<dyn Read>, Error>;
}
