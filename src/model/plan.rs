use once_cell::sync::Lazy;

use super::entitlement::Capacity;

/// Static plan catalog: configuration data, not runtime state. Grants resolve
/// plan parameters from here by id.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: &'static str,
    pub display_name: &'static str,
    /// `None` means the plan never expires.
    pub duration_days: Option<u32>,
    pub files_allowed: Capacity,
    pub price_inr: u32,
    pub is_trial: bool,
}

pub static PLANS: Lazy<Vec<Plan>> = Lazy::new(|| {
    vec![
        Plan {
            id: "trial",
            display_name: "Free Trial",
            duration_days: Some(3),
            files_allowed: Capacity::Limited(20),
            price_inr: 0,
            is_trial: true,
        },
        Plan {
            id: "bronze",
            display_name: "Bronze",
            duration_days: Some(30),
            files_allowed: Capacity::Limited(500),
            price_inr: 49,
            is_trial: false,
        },
        Plan {
            id: "silver",
            display_name: "Silver",
            duration_days: Some(90),
            files_allowed: Capacity::Limited(2000),
            price_inr: 129,
            is_trial: false,
        },
        Plan {
            id: "gold",
            display_name: "Gold",
            duration_days: Some(365),
            files_allowed: Capacity::Unlimited,
            price_inr: 399,
            is_trial: false,
        },
        Plan {
            id: "lifetime",
            display_name: "Lifetime",
            duration_days: None,
            files_allowed: Capacity::Unlimited,
            price_inr: 999,
            is_trial: false,
        },
    ]
});

pub fn find_plan(id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|plan| plan.id == id)
}
