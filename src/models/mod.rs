pub mod article;
pub mod expense;
pub mod extraction;
pub mod receipt;

pub use article::{
    Article, ArticleAlias, PriceBasis, PriceObservation, Resolution, UnmappedGroup, UnmappedItem,
    CONFIRMED_CONFIDENCE,
};
pub use expense::{
    Expense, ExpenseItem, FieldError, Payer, PayerRef, PostOutcome, ReviewData, ReviewItem,
    Supplier, SupplierRef, ValidatedItem, ValidatedReview,
};
pub use extraction::{ExtractedItem, ExtractedReceipt, ExtractionSchema, SchemaRejection, RECEIPT_SCHEMA_V1};
pub use receipt::{PaymentHints, Receipt, ReceiptGuesses, ReceiptStatus, ReceiptView, UploadOutcome};
