//! Checks the integrity rules enforced by the database itself.
//!
//! Each test runs inside a transaction that is never committed, so they can
//! share one scratch database:
//! `DATABASE_URL=postgres://... cargo test -- --ignored --test-threads=1`.

use diesel::pg::PgConnection;
use diesel::result::{DatabaseErrorKind, Error};
use diesel::sql_types::{Date, Text};
use diesel::{sql_query, Connection, QueryableByName, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn connection() -> PgConnection {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut conn = PgConnection::establish(&url).unwrap();
    conn.run_pending_migrations(MIGRATIONS).unwrap();
    conn.begin_test_transaction().unwrap();
    conn
}

fn seed_participant(conn: &mut PgConnection, matricule: &str) {
    sql_query(format!(
        "INSERT INTO seminaristes (matricule, nom, prenom, genre, commune, statut) \
         VALUES ('{matricule}', 'Koné', 'Awa', 'Femme', 'Cocody', 'Élève')"
    ))
    .execute(conn)
    .unwrap();
}

fn seed_user(conn: &mut PgConnection, username: &str, role: &str) -> i32 {
    #[derive(QueryableByName)]
    struct Inserted {
        #[diesel(sql_type = diesel::sql_types::Integer)]
        id: i32,
    }
    sql_query(format!(
        "INSERT INTO utilisateurs (username, role, password_hash) \
         VALUES ('{username}', '{role}', 'x') RETURNING id"
    ))
    .get_result::<Inserted>(conn)
    .unwrap()
    .id
}

fn violation(result: Result<usize, Error>) -> DatabaseErrorKind {
    match result {
        Err(Error::DatabaseError(kind, _)) => kind,
        other => panic!("expected a constraint violation, got {other:?}"),
    }
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn unknown_role_is_rejected() {
    let mut conn = connection();
    let result = sql_query(
        "INSERT INTO utilisateurs (username, role, password_hash) VALUES ('bob', 'Infirmier', 'x')",
    )
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::CheckViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn duplicate_username_is_rejected() {
    let mut conn = connection();
    seed_user(&mut conn, "admin", "Admin");
    let result = sql_query(
        "INSERT INTO utilisateurs (username, role, password_hash) VALUES ('admin', 'Scientifique', 'y')",
    )
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::UniqueViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn unknown_genre_is_rejected() {
    let mut conn = connection();
    let result = sql_query(
        "INSERT INTO seminaristes (matricule, nom, prenom, genre, commune, statut) \
         VALUES ('X-1', 'Koné', 'Awa', 'Autre', 'Cocody', 'Élève')",
    )
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::CheckViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn commune_and_statut_are_required() {
    let mut conn = connection();
    let missing_commune = sql_query(
        "INSERT INTO seminaristes (matricule, nom, prenom, genre, statut) \
         VALUES ('X-2', 'Koné', 'Awa', 'Femme', 'Élève')",
    )
    .execute(&mut conn);
    assert!(matches!(violation(missing_commune), DatabaseErrorKind::NotNullViolation));

    let mut conn = connection();
    let missing_statut = sql_query(
        "INSERT INTO seminaristes (matricule, nom, prenom, genre, commune) \
         VALUES ('X-3', 'Koné', 'Awa', 'Femme', 'Cocody')",
    )
    .execute(&mut conn);
    assert!(matches!(violation(missing_statut), DatabaseErrorKind::NotNullViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn note_needs_existing_participant() {
    let mut conn = connection();
    let result = sql_query(
        "INSERT INTO notes (matricule, libelle, valeur) VALUES ('NOPE-001', 'Fiqh', 12.5)",
    )
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::ForeignKeyViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn consultation_needs_existing_participant_and_physician() {
    let mut conn = connection();
    let medecin = seed_user(&mut conn, "medecin1", "Médecin");
    let result = sql_query(format!(
        "INSERT INTO consultations (matricule, medecin_id) VALUES ('NOPE-001', {medecin})"
    ))
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::ForeignKeyViolation));

    let mut conn = connection();
    seed_participant(&mut conn, "ANNOUR25-001");
    let result = sql_query(
        "INSERT INTO consultations (matricule, medecin_id) VALUES ('ANNOUR25-001', -1)",
    )
    .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::ForeignKeyViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn referenced_participant_cannot_be_deleted() {
    let mut conn = connection();
    seed_participant(&mut conn, "ANNOUR25-001");
    sql_query("INSERT INTO notes (matricule, libelle, valeur) VALUES ('ANNOUR25-001', 'Fiqh', 14)")
        .execute(&mut conn)
        .unwrap();
    let result = sql_query("DELETE FROM seminaristes WHERE matricule = 'ANNOUR25-001'")
        .execute(&mut conn);
    assert!(matches!(violation(result), DatabaseErrorKind::ForeignKeyViolation));
}

#[test]
#[ignore = "requires a PostgreSQL instance at DATABASE_URL"]
fn dates_default_to_today() {
    #[derive(QueryableByName)]
    struct Dated {
        #[diesel(sql_type = Text)]
        matricule: String,
        #[diesel(sql_type = Date)]
        day: chrono::NaiveDate,
    }

    let mut conn = connection();
    seed_participant(&mut conn, "ANNOUR25-001");
    let medecin = seed_user(&mut conn, "medecin1", "Médecin");

    let note = sql_query(
        "INSERT INTO notes (matricule, libelle, valeur) VALUES ('ANNOUR25-001', 'Fiqh', 14) \
         RETURNING matricule, date_enregistrement AS day",
    )
    .get_result::<Dated>(&mut conn)
    .unwrap();
    let visit = sql_query(format!(
        "INSERT INTO consultations (matricule, medecin_id) VALUES ('ANNOUR25-001', {medecin}) \
         RETURNING matricule, date_consultation AS day"
    ))
    .get_result::<Dated>(&mut conn)
    .unwrap();

    #[derive(QueryableByName)]
    struct Today {
        #[diesel(sql_type = Date)]
        today: chrono::NaiveDate,
    }
    let today = sql_query("SELECT CURRENT_DATE AS today")
        .get_result::<Today>(&mut conn)
        .unwrap()
        .today;

    assert_eq!(note.matricule, "ANNOUR25-001");
    assert_eq!(note.day, today);
    assert_eq!(visit.day, today);
}
