use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id            TEXT PRIMARY KEY,
            display_name  TEXT NOT NULL,
            avatar_url    TEXT,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS signals (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES profiles(id),
            movie_id          INTEGER NOT NULL,
            movie_title       TEXT NOT NULL,
            movie_poster      TEXT,
            theater_name      TEXT,
            showtime          TEXT,
            tag               TEXT NOT NULL
                CHECK (tag IN ('has_ticket', 'seek_companion', 'pure_watch', 'want_discuss')),
            note              TEXT,
            location          TEXT,
            intent            TEXT
                CHECK (intent IS NULL OR intent IN ('aa_split', 'i_treat', 'just_watch')),
            gender_age_label  TEXT,
            is_active         INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_signals_active
            ON signals(is_active, created_at);

        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            sender_id    TEXT NOT NULL REFERENCES profiles(id),
            receiver_id  TEXT NOT NULL REFERENCES profiles(id),
            content      TEXT NOT NULL,
            is_read      INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_receiver
            ON messages(receiver_id, is_read);

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
