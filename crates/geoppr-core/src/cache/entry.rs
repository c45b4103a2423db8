use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload and the moment it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub stored_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            stored_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.stored_at
    }

    pub fn age_minutes(&self) -> i64 {
        self.age().num_minutes()
    }

    /// True once the entry is at least `ttl` old.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }

    pub fn age_display(&self) -> String {
        age_display(self.stored_at)
    }
}

/// Human-readable age such as `"5m ago"` or `"2d ago"`.
pub fn age_display(stored_at: DateTime<Utc>) -> String {
    let minutes = (Utc::now() - stored_at).num_minutes();
    if minutes < 1 {
        // Clock skew lands here too
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
