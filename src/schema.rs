// The two key modes share one `books` table layout and differ only in the
// SQL type of `id`. A database is created for exactly one of them.

pub mod surrogate {
    diesel::table! {
        books (id) {
            id -> BigInt,
            title -> Text,
            author -> Text,
            isbn -> Text,
            category -> Text,
            status -> Text,
            publish_date -> Text,
            description -> Text,
            interview_times -> Integer,
            price -> Double,
        }
    }
}

pub mod external {
    diesel::table! {
        books (id) {
            id -> Text,
            title -> Text,
            author -> Text,
            isbn -> Text,
            category -> Text,
            status -> Text,
            publish_date -> Text,
            description -> Text,
            interview_times -> Integer,
            price -> Double,
        }
    }
}
