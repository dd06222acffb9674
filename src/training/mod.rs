//! There is no training code implemented in this project, the model is trained by an external
//! framework. This module prepares what that framework consumes: the cleaned sentence corpus,
//! the metadata file and the character set, plus some dataset analysis along the way.

pub mod analytics;
pub mod corpus;
pub mod metadata;
pub mod vocabulary;

pub use analytics::*;
pub use corpus::*;
pub use metadata::*;
pub use vocabulary::*;
