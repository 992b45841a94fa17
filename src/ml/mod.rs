pub mod adamax;
pub mod augment;
pub mod dataset;
pub mod evaluation;
pub mod image_io;
pub mod inference;
pub mod lr_policy;
pub mod ml_model;
pub mod pipeline;
pub mod training;

pub use adamax::{Adamax, AdamaxConfig};
pub use augment::{AugmentPolicy, Augmentor};
pub use dataset::{DatasetAssembler, LabeledImage, LesionDataset, Provenance, Split};
pub use evaluation::{ConfusionMatrix, EvaluationReport, EvaluationReporter, Regularization};
pub use inference::{InferenceBackend, InferenceEngine, LesionPredictor};
pub use lr_policy::PlateauPolicy;
pub use ml_model::{ModelConfig, SkinLesionClassifier};
pub use pipeline::{run_training, TrainingOutcome};
pub use training::{EpochRecord, TrainingController, TrainingState};
