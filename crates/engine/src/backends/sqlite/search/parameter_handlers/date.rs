//! Date and date-time parameter SQL handler.

use chrono::{DateTime, Utc};

use crate::types::{DateFilterValue, SearchPrefix, epoch_day};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles date parameter SQL generation.
///
/// Both `date_index` (epoch days) and `date_time_index` (epoch millis)
/// store an inclusive `[index_from, index_to]` range, so one set of range
/// conditions serves both; only the unit of the bound values differs.
pub struct DateHandler;

impl DateHandler {
    /// Builds SQL comparing the stored range against the search value's range.
    ///
    /// `now` anchors the `ap` prefix, whose tolerance is a tenth of the
    /// distance between the value and the current time.
    pub fn build_sql(prefix: SearchPrefix, value: &DateFilterValue, now: DateTime<Utc>) -> SqlFragment {
        let ((start, end), now) = match value {
            DateFilterValue::Date(date) => (date.epoch_day_range(), epoch_day(now.date_naive())),
            DateFilterValue::DateTime(date_time) => {
                (date_time.epoch_millis_range(), now.timestamp_millis())
            }
        };
        let int = SqlParam::Integer;

        match prefix {
            SearchPrefix::Eq => SqlFragment::with_params(
                "index_from BETWEEN ? AND ? AND index_to BETWEEN ? AND ?",
                vec![int(start), int(end), int(start), int(end)],
            ),
            SearchPrefix::Ne => SqlFragment::with_params(
                "(index_from NOT BETWEEN ? AND ? OR index_to NOT BETWEEN ? AND ?)",
                vec![int(start), int(end), int(start), int(end)],
            ),
            SearchPrefix::Gt => SqlFragment::with_params("index_to > ?", vec![int(end)]),
            SearchPrefix::Ge => SqlFragment::with_params("index_to >= ?", vec![int(start)]),
            SearchPrefix::Lt => SqlFragment::with_params("index_from < ?", vec![int(start)]),
            SearchPrefix::Le => SqlFragment::with_params("index_from <= ?", vec![int(end)]),
            SearchPrefix::Sa => SqlFragment::with_params("index_from > ?", vec![int(end)]),
            SearchPrefix::Eb => SqlFragment::with_params("index_to < ?", vec![int(start)]),
            SearchPrefix::Ap => {
                let margin = now.saturating_sub(start).saturating_abs() / 10;
                SqlFragment::with_params(
                    "index_from <= ? AND index_to >= ?",
                    vec![
                        int(end.saturating_add(margin)),
                        int(start.saturating_sub(margin)),
                    ],
                )
            }
        }
    }
}
