//! Vision-driven web navigation agent.
//!
//! The loop: capture a screenshot, ask a vision model for the next action,
//! execute it in a real browser, stream the result. Organ naming throughout:
//! `brain` decides, `hands` touch the browser, `face` talks to clients.

pub mod brain;
pub mod executor;
pub mod face;
pub mod gemini;
pub mod hands;
pub mod navigator;
pub mod types;
