//! Background synchronization with the cloud control plane.

mod puller;

pub use puller::CurriculumPuller;
