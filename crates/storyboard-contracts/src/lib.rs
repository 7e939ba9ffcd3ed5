pub mod dossiers;
pub mod events;
pub mod files;
pub mod media;
pub mod models;
pub mod story;
