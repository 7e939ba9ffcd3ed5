mod registry;
mod store;

pub use registry::{Dossier, DossierRegistry, InMemoryDossierRegistry, SubjectKind};
pub use store::JsonDossierRegistry;
