//! Domain models for commons-billing.

mod invoice;
mod line_item;
mod resource;
mod usage_record;

pub use invoice::{
    Invoice, InvoiceStatus, InvoiceWithItems, ListInvoicesFilter, PeriodSummary,
};
pub use line_item::{AddManualLineItem, LineItem, NewLineItem};
pub use resource::{
    CreateResource, ListResourcesFilter, PricingModel, PricingUnit, Resource, UpdateResource,
};
pub use usage_record::{
    CheckInResource, CheckOutResource, CorrectReadings, ListUsageFilter, UsageRecord, UsageStatus,
};
