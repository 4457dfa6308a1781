//! Natural-key reconciliation.
//!
//! Pure decisions: given what the local store already holds for a natural key,
//! what should applying a remote mutation do. Surrogate ids only appear here
//! when both sides of a comparison come from the same local store.

use serde_json::Value as JsonValue;
use thiserror::Error;

use shelfsync_core::{Book, BorrowRecord, User, UserId};

/// Field names that identify rows by a store-local id.
pub const SURROGATE_ID_FIELDS: [&str; 3] = ["id", "user_id", "book_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateDecision<T> {
    Insert,
    /// Already present; nothing to do.
    Skip(T),
}

pub fn decide_create<T>(existing: Option<T>) -> CreateDecision<T> {
    match existing {
        Some(row) => CreateDecision::Skip(row),
        None => CreateDecision::Insert,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteDecision<T> {
    Delete(T),
    AlreadyAbsent,
}

pub fn decide_delete<T>(existing: Option<T>) -> DeleteDecision<T> {
    match existing {
        Some(row) => DeleteDecision::Delete(row),
        None => DeleteDecision::AlreadyAbsent,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BorrowDecision {
    /// Book is on the shelf: record the loan and mark it out.
    Borrow,
    /// This user's loan is already recorded; re-set the same return date.
    Reaffirm(BorrowRecord),
    /// Book is out but the ledger lacks this loan (earlier partial apply).
    Repair,
    /// Book is out to someone else.
    Conflict { holder: UserId },
}

/// Decide how a `book.borrowed` applies given local state.
///
/// `latest` is the newest ledger entry for `book`. A latest entry held by
/// another user only counts as a conflict while the book's current return date
/// is that entry's; otherwise the entry is an older, finished loan and the
/// current one is missing from the ledger.
pub fn decide_borrow(book: &Book, latest: Option<BorrowRecord>, user: &User) -> BorrowDecision {
    if book.available {
        return BorrowDecision::Borrow;
    }
    match latest {
        None => BorrowDecision::Repair,
        Some(record) if record.user_id == user.id => BorrowDecision::Reaffirm(record),
        Some(record) if book.return_date == Some(record.return_date) => BorrowDecision::Conflict {
            holder: record.user_id,
        },
        Some(_) => BorrowDecision::Repair,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("payload carries surrogate id field `{field}`")]
pub struct SurrogateIdLeak {
    pub field: String,
}

/// Reject payload objects (or elements of a payload list) that carry
/// store-local id fields.
pub fn reject_surrogate_ids(payload: &JsonValue) -> Result<(), SurrogateIdLeak> {
    match payload {
        JsonValue::Object(map) => {
            match SURROGATE_ID_FIELDS.iter().find(|f| map.contains_key(**f)) {
                Some(field) => Err(SurrogateIdLeak {
                    field: (*field).to_string(),
                }),
                None => Ok(()),
            }
        }
        JsonValue::Array(items) => items.iter().try_for_each(reject_surrogate_ids),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use serde_json::json;
    use shelfsync_core::{BookId, BorrowId, Email, Isbn};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, day).unwrap()
    }

    fn book(available: bool, return_date: Option<NaiveDate>) -> Book {
        Book {
            id: BookId::new(10),
            isbn: Isbn::parse("9780262033848").unwrap(),
            title: "CLRS".into(),
            author: "Cormen".into(),
            publisher: "mit".into(),
            category: "technology".into(),
            available,
            return_date,
        }
    }

    fn user(id: i64) -> User {
        User {
            id: UserId::new(id),
            email: Email::parse(&format!("u{id}@lib.org")).unwrap(),
            firstname: "U".into(),
            lastname: "Ser".into(),
            created_at: Utc::now(),
        }
    }

    fn record(user_id: i64, return_date: NaiveDate) -> BorrowRecord {
        BorrowRecord {
            id: BorrowId::new(1),
            user_id: UserId::new(user_id),
            book_id: BookId::new(10),
            borrow_date: date(1),
            return_date,
        }
    }

    #[test]
    fn create_and_delete_follow_presence() {
        assert_eq!(decide_create::<u8>(None), CreateDecision::Insert);
        assert_eq!(decide_create(Some(1)), CreateDecision::Skip(1));
        assert_eq!(decide_delete(Some(1)), DeleteDecision::Delete(1));
        assert_eq!(decide_delete::<u8>(None), DeleteDecision::AlreadyAbsent);
    }

    #[test]
    fn available_book_is_borrowed() {
        assert_eq!(decide_borrow(&book(true, None), None, &user(1)), BorrowDecision::Borrow);
    }

    #[test]
    fn same_holder_is_reaffirmed() {
        let rec = record(1, date(20));
        assert_eq!(
            decide_borrow(&book(false, Some(date(20))), Some(rec.clone()), &user(1)),
            BorrowDecision::Reaffirm(rec)
        );
    }

    #[test]
    fn missing_record_is_repaired() {
        assert_eq!(
            decide_borrow(&book(false, Some(date(20))), None, &user(1)),
            BorrowDecision::Repair
        );
    }

    #[test]
    fn other_current_holder_conflicts() {
        assert_eq!(
            decide_borrow(&book(false, Some(date(20))), Some(record(2, date(20))), &user(1)),
            BorrowDecision::Conflict { holder: UserId::new(2) }
        );
    }

    #[test]
    fn stale_record_of_other_user_is_repaired() {
        assert_eq!(
            decide_borrow(&book(false, Some(date(25))), Some(record(2, date(10))), &user(1)),
            BorrowDecision::Repair
        );
    }

    #[test]
    fn surrogate_fields_are_rejected_in_objects_and_lists() {
        assert!(reject_surrogate_ids(&json!({"isbn": "1"})).is_ok());
        assert_eq!(
            reject_surrogate_ids(&json!({"isbn": "1", "book_id": 4})).unwrap_err().field,
            "book_id"
        );
        assert!(reject_surrogate_ids(&json!([{"isbn": "1"}, {"id": 3, "isbn": "2"}])).is_err());
        assert!(reject_surrogate_ids(&json!([])).is_ok());
    }
}
