//! Pricing for image generation.
//!
//! The price is fixed when the job is submitted and held in full; it is
//! never adjusted afterwards.

use serde::{Deserialize, Serialize};

use crate::job::{GenerationRequest, Resolution};

/// Credits charged per generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Base price at 1K resolution.
    pub one_k_credits: i64,

    /// Base price at 2K resolution.
    pub two_k_credits: i64,

    /// Base price at 4K resolution.
    pub four_k_credits: i64,

    /// Surcharge per reference image.
    pub image_input_credits: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            one_k_credits: 100,
            two_k_credits: 150,
            four_k_credits: 240,
            image_input_credits: 10,
        }
    }
}

impl PricingConfig {
    /// Base price for a resolution tier.
    #[must_use]
    pub const fn base_price(&self, resolution: Resolution) -> i64 {
        match resolution {
            Resolution::OneK => self.one_k_credits,
            Resolution::TwoK => self.two_k_credits,
            Resolution::FourK => self.four_k_credits,
        }
    }

    /// Credits to hold for `request`.
    #[must_use]
    pub fn cost_of(&self, request: &GenerationRequest) -> i64 {
        let inputs = i64::try_from(request.image_inputs.len()).unwrap_or(i64::MAX);
        self.base_price(request.resolution)
            .saturating_add(inputs.saturating_mul(self.image_input_credits))
    }
}
