// SPDX-License-Identifier: GPL-3.0-or-later
pub mod error;
pub mod gateway;
pub mod health;
pub mod metadata;
pub mod models;
pub mod peer;

pub use error::{ProviderError, Result};
pub use gateway::{Provider, ProviderGateway};
pub use health::{HealthSnapshot, OverallHealth, ProviderHealthMonitor};
pub use metadata::{HttpMetadataProvider, MetadataProvider};
pub use models::{
    ArtistWithReleases, DownloadRequestFile, DownloadTicket, DownloadTicketState, PeerFile,
    PeerResult, ProbeStatus, ProviderArtist, ProviderHealth, ProviderPlaylist, ProviderRelease,
    ProviderTrack,
};
pub use peer::{HttpPeerDaemon, PeerDaemon};
