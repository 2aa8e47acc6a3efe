//! Cross-community social-bot detection via graph domain adaptation.
//!
//! A labeled source community and an unlabeled target community are encoded
//! by a shared multi-modal model: MLP encoders for metadata and text, a
//! relational graph convolution over their detached embeddings, and an
//! attention block fusing the three views into one node representation. The
//! model adapts to the target through a composite objective of supervised
//! source cross-entropy, sliced Wasserstein feature alignment, target
//! conditional entropy and virtual adversarial smoothing, with the source
//! terms annealed over the run. Evaluation goes through EMA shadow models.

pub mod classifier;
pub mod config;
pub mod conv;
pub mod data;
pub mod ema;
pub mod error;
pub mod fusion;
pub mod losses;
pub mod metrics;
pub mod sampler;
pub mod schedule;
pub mod train;
pub mod vat;

pub use classifier::Classifier;
pub use config::{Args, Config};
pub use data::CommunityData;
pub use ema::Ema;
pub use error::{Error, Result};
pub use fusion::FeatureGenerator;
pub use sampler::{GraphBatch, NeighborSampler};
pub use schedule::SsaSchedule;
pub use train::{run_pair, PairSummary};
pub use vat::VatLoss;
