//! Opportunities: the work items the pilot decides on.

pub mod model;

pub use model::{
    Budget, Counterpart, DispatchState, Opportunity, ProcessingMetadata, ProcessingStatus,
};
