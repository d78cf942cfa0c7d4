//! API models for persisted rows and request/response payloads

pub mod course;
pub mod purchase;

pub use course::{Course, CourseSummary};
pub use purchase::{
    CreatePaymentIntentRequest, CreatePurchaseRequest, InvalidPaymentStatus, ListPurchasesQuery,
    NewPurchase, PaymentIntentResponse, PaymentStatus, Purchase, PurchaseAccess, PurchaseFilter,
    PurchaseListResponse, PurchaseStats, PurchasedCourse, ResendCredentialsResponse, StatusChange,
    SyncPaymentRequest, TransitionOutcome, UpdatePaymentStatusRequest,
};
