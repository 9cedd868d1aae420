pub mod article_resolver;
pub mod extraction_client;
pub mod intake;
pub mod posting;
pub mod receipts;
pub mod review_policy;
pub mod state_machine;
pub mod storage;
pub mod worker;

pub use article_resolver::{ArticleService, ArticleTarget, MappingOutcome};
pub use extraction_client::{
    ExtractSource, ExtractionClient, ExtractionFailure, ExtractionProvider, HttpExtractionProvider, ProviderError,
    RetryConfig,
};
pub use intake::{DedupDecision, DedupGate, IntakeService, UploadRequest};
pub use posting::PostingService;
pub use receipts::ReceiptService;
pub use review_policy::{CompositePolicy, MinConfidencePolicy, RequiredFieldsPolicy, ReviewPolicy};
pub use storage::{LocalDirStorage, MemoryStorage, Storage, StorageError};
pub use worker::{ProcessingWorker, RetrySchedule, WorkerConfig};
