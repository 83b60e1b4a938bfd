use std::fmt;
use std::io::Write;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{Local, NaiveDate};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsChangeset, AsExpression, FromSqlRow, Insertable, Queryable, Selectable};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use crate::schema::{consultations, notes, seminaristes, utilisateurs};

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Account role, stored as its display name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    AsExpression,
    FromSqlRow,
)]
#[diesel(sql_type = Text)]
pub enum Role {
    Admin,
    Scientifique,
    #[serde(rename = "Médecin")]
    Medecin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Scientifique, Role::Medecin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Scientifique => "Scientifique",
            Role::Medecin => "Médecin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "role",
                value: s.to_owned(),
            })
    }
}

impl ToSql<Text, Pg> for Role {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for Role {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

/// Participant gender, constrained by the schema to two values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
pub enum Genre {
    Homme,
    Femme,
}

impl Genre {
    pub fn as_str(&self) -> &'static str {
        match self {
            Genre::Homme => "Homme",
            Genre::Femme => "Femme",
        }
    }
}

impl FromStr for Genre {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Homme" => Ok(Genre::Homme),
            "Femme" => Ok(Genre::Femme),
            _ => Err(UnknownVariant {
                kind: "genre",
                value: s.to_owned(),
            }),
        }
    }
}

impl ToSql<Text, Pg> for Genre {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for Genre {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

// ---- accounts ----

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug)]
#[diesel(table_name = utilisateurs)]
#[diesel(check_for_backend(Pg))]
pub struct Utilisateur {
    pub id: i32,
    pub username: String,
    pub role: Role,
    #[serde(skip)]
    pub password_hash: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = utilisateurs)]
pub struct NewUtilisateur {
    pub username: String,
    pub role: Role,
    pub password_hash: String,
}

#[derive(AsChangeset, Default, Debug)]
#[diesel(table_name = utilisateurs)]
pub struct UtilisateurChanges {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub password_hash: Option<String>,
}

impl UtilisateurChanges {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.role.is_none() && self.password_hash.is_none()
    }
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, max = 100))]
    pub username: String,
    #[validate(length(min = 8))]
    pub password: String,
    pub role: Role,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct UserUpdate {
    #[validate(length(min = 1, max = 100))]
    pub username: Option<String>,
    #[validate(length(min = 8))]
    pub password: Option<String>,
    pub role: Option<Role>,
}

#[derive(ToSchema, Default, Deserialize)]
pub struct AuthUser {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct EntityId {
    pub id: i32,
}

#[derive(Deserialize, Default)]
pub struct RoleFilter {
    pub role: Option<Role>,
}

// ---- participants ----

#[derive(ToSchema, Serialize, Selectable, Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = seminaristes)]
#[diesel(check_for_backend(Pg))]
pub struct Seminariste {
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub date_naissance: Option<NaiveDate>,
    pub genre: Genre,
    pub contact: Option<String>,
    pub commune: String,
    pub statut: String,
    pub niveau_etude: Option<String>,
    pub allergies: Option<String>,
    pub antecedents_medicaux: Option<String>,
}

/// Registration form; the code is generated when omitted.
#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct NewSeminariste {
    #[validate(length(min = 1, max = 50))]
    pub matricule: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub nom: String,
    #[validate(length(min = 1, max = 100))]
    pub prenom: String,
    #[validate(custom(function = "not_in_future"))]
    pub date_naissance: Option<NaiveDate>,
    pub genre: Genre,
    #[validate(length(max = 50))]
    pub contact: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub commune: String,
    #[validate(length(min = 1, max = 50))]
    pub statut: String,
    #[validate(length(max = 100))]
    pub niveau_etude: Option<String>,
    pub allergies: Option<String>,
    pub antecedents_medicaux: Option<String>,
}

impl NewSeminariste {
    pub fn into_record(self, matricule: String) -> Seminariste {
        Seminariste {
            matricule,
            nom: self.nom,
            prenom: self.prenom,
            date_naissance: self.date_naissance,
            genre: self.genre,
            contact: self.contact,
            commune: self.commune,
            statut: self.statut,
            niveau_etude: self.niveau_etude,
            allergies: self.allergies,
            antecedents_medicaux: self.antecedents_medicaux,
        }
    }
}

/// Partial update. On nullable columns an explicit `null` clears the value,
/// an absent field leaves it untouched.
#[derive(Deserialize, ToSchema, AsChangeset, Validate, Debug, Default)]
#[diesel(table_name = seminaristes)]
#[validate(schema(function = "check_seminariste_changes"))]
pub struct SeminaristeChanges {
    #[validate(length(min = 1, max = 100))]
    pub nom: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub prenom: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>, format = Date)]
    pub date_naissance: Option<Option<NaiveDate>>,
    pub genre: Option<Genre>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub contact: Option<Option<String>>,
    #[validate(length(min = 1, max = 100))]
    pub commune: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub statut: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub niveau_etude: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub allergies: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub antecedents_medicaux: Option<Option<String>>,
}

impl SeminaristeChanges {
    pub fn is_empty(&self) -> bool {
        self.nom.is_none()
            && self.prenom.is_none()
            && self.date_naissance.is_none()
            && self.genre.is_none()
            && self.contact.is_none()
            && self.commune.is_none()
            && self.statut.is_none()
            && self.niveau_etude.is_none()
            && self.allergies.is_none()
            && self.antecedents_medicaux.is_none()
    }
}

#[derive(Deserialize)]
pub struct MatriculeParam {
    pub matricule: String,
}

#[derive(Deserialize, Default)]
pub struct OptionalMatricule {
    pub matricule: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

#[derive(Deserialize, Debug, Validate)]
pub struct SeminaristeQuery {
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: i64,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
    pub search: Option<String>,
    pub genre: Option<Genre>,
    pub commune: Option<String>,
    pub statut: Option<String>,
    pub niveau_etude: Option<String>,
}

impl Default for SeminaristeQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            search: None,
            genre: None,
            commune: None,
            statut: None,
            niveau_etude: None,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct Page<T> {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub data: Vec<T>,
}

// ---- grades ----

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug)]
#[diesel(table_name = notes)]
#[diesel(check_for_backend(Pg))]
pub struct Note {
    pub id: i32,
    pub matricule: String,
    pub libelle: String,
    #[schema(value_type = String, example = "14.50")]
    pub valeur: BigDecimal,
    pub observation: Option<String>,
    pub date_enregistrement: NaiveDate,
}

#[derive(Deserialize, ToSchema, Insertable, Validate, Debug)]
#[diesel(table_name = notes)]
pub struct NewNote {
    #[validate(length(min = 1, max = 50))]
    pub matricule: String,
    #[validate(length(min = 1, max = 100))]
    pub libelle: String,
    #[schema(value_type = String, example = "14.50")]
    #[serde(deserialize_with = "grade")]
    #[validate(custom(function = "grade_in_range"))]
    pub valeur: BigDecimal,
    pub observation: Option<String>,
    /// Defaults to the current date on the database side.
    pub date_enregistrement: Option<NaiveDate>,
}

#[derive(Deserialize, ToSchema, AsChangeset, Validate, Debug, Default)]
#[diesel(table_name = notes)]
pub struct NoteChanges {
    #[validate(length(min = 1, max = 100))]
    pub libelle: Option<String>,
    #[schema(value_type = Option<String>)]
    #[serde(default, deserialize_with = "optional_grade")]
    #[validate(custom(function = "grade_in_range"))]
    pub valeur: Option<BigDecimal>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub observation: Option<Option<String>>,
    pub date_enregistrement: Option<NaiveDate>,
}

impl NoteChanges {
    pub fn is_empty(&self) -> bool {
        self.libelle.is_none()
            && self.valeur.is_none()
            && self.observation.is_none()
            && self.date_enregistrement.is_none()
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct Bulletin {
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub notes: Vec<Note>,
    #[schema(value_type = String)]
    pub moyenne: BigDecimal,
    pub mention: String,
    pub rang: usize,
    pub effectif: usize,
}

// ---- consultations ----

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug)]
#[diesel(table_name = consultations)]
#[diesel(check_for_backend(Pg))]
pub struct Consultation {
    pub id: i32,
    pub matricule: String,
    pub medecin_id: i32,
    pub motif: Option<String>,
    pub diagnostic: Option<String>,
    pub notes_cliniques: Option<String>,
    pub prescription: Option<String>,
    pub date_consultation: NaiveDate,
}

#[derive(Deserialize, ToSchema, Validate, Debug)]
pub struct NewConsultation {
    #[validate(length(min = 1, max = 50))]
    pub matricule: String,
    pub motif: Option<String>,
    pub diagnostic: Option<String>,
    pub notes_cliniques: Option<String>,
    pub prescription: Option<String>,
    pub date_consultation: Option<NaiveDate>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = consultations)]
pub struct ConsultationRecord {
    pub matricule: String,
    pub medecin_id: i32,
    pub motif: Option<String>,
    pub diagnostic: Option<String>,
    pub notes_cliniques: Option<String>,
    pub prescription: Option<String>,
    pub date_consultation: Option<NaiveDate>,
}

impl NewConsultation {
    pub fn attended_by(self, medecin_id: i32) -> ConsultationRecord {
        ConsultationRecord {
            matricule: self.matricule,
            medecin_id,
            motif: self.motif,
            diagnostic: self.diagnostic,
            notes_cliniques: self.notes_cliniques,
            prescription: self.prescription,
            date_consultation: self.date_consultation,
        }
    }
}

#[derive(Deserialize, ToSchema, AsChangeset, Debug, Default)]
#[diesel(table_name = consultations)]
pub struct ConsultationChanges {
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub motif: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub diagnostic: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub notes_cliniques: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub prescription: Option<Option<String>>,
    pub date_consultation: Option<NaiveDate>,
}

impl ConsultationChanges {
    pub fn is_empty(&self) -> bool {
        self.motif.is_none()
            && self.diagnostic.is_none()
            && self.notes_cliniques.is_none()
            && self.prescription.is_none()
            && self.date_consultation.is_none()
    }
}

// ---- serde helpers ----

/// Keeps an explicit `null` (`Some(None)`) apart from an absent field (`None`).
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

struct GradeVisitor;

impl Visitor<'_> for GradeVisitor {
    type Value = BigDecimal;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a grade as a number or a decimal string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<BigDecimal, E> {
        BigDecimal::from_str(v.trim()).map_err(E::custom)
    }

    // the shortest decimal form of the float, not its binary expansion
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<BigDecimal, E> {
        if !v.is_finite() {
            return Err(E::custom("grade must be finite"));
        }
        BigDecimal::from_str(&v.to_string()).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<BigDecimal, E> {
        Ok(BigDecimal::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigDecimal, E> {
        Ok(BigDecimal::from(v))
    }
}

fn grade<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigDecimal, D::Error> {
    deserializer.deserialize_any(GradeVisitor)
}

fn optional_grade<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<BigDecimal>, D::Error> {
    #[derive(Deserialize)]
    struct Grade(#[serde(deserialize_with = "grade")] BigDecimal);

    Option::<Grade>::deserialize(deserializer).map(|v| v.map(|Grade(value)| value))
}

// ---- validators ----

fn check_seminariste_changes(changes: &SeminaristeChanges) -> Result<(), ValidationError> {
    if let Some(Some(date)) = &changes.date_naissance {
        not_in_future(date)?;
    }
    let limits = [(&changes.contact, 50), (&changes.niveau_etude, 100)];
    for (value, max) in limits {
        if let Some(Some(text)) = value {
            if text.chars().count() > max {
                return Err(ValidationError::new("length"));
            }
        }
    }
    Ok(())
}

fn not_in_future(date: &NaiveDate) -> Result<(), ValidationError> {
    if *date > Local::now().date_naive() {
        return Err(ValidationError::new("date_in_future"));
    }
    Ok(())
}

/// Grades are out of 20 and fit `NUMERIC(5,2)`.
fn grade_in_range(value: &BigDecimal) -> Result<(), ValidationError> {
    if *value < BigDecimal::from(0) || *value > BigDecimal::from(20) {
        return Err(ValidationError::new("grade_out_of_range"));
    }
    if value.normalized().as_bigint_and_exponent().1 > 2 {
        return Err(ValidationError::new("grade_precision"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_match_schema_check() {
        assert_eq!("Médecin".parse::<Role>().unwrap(), Role::Medecin);
        assert_eq!(Role::Scientifique.to_string(), "Scientifique");
        assert!("Medecin".parse::<Role>().is_err());
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_with_accent() {
        let json = serde_json::to_string(&Role::Medecin).unwrap();
        assert_eq!(json, "\"Médecin\"");
        let role: Role = serde_json::from_str("\"Admin\"").unwrap();
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn genre_rejects_other_values() {
        assert_eq!("Femme".parse::<Genre>().unwrap(), Genre::Femme);
        assert!("M".parse::<Genre>().is_err());
        assert!(serde_json::from_str::<Genre>("\"Autre\"").is_err());
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let user = Utilisateur {
            id: 3,
            username: "awa".into(),
            role: Role::Medecin,
            password_hash: "$argon2id$secret".into(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["role"], "Médecin");
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn empty_changesets_are_detected() {
        assert!(SeminaristeChanges::default().is_empty());
        assert!(ConsultationChanges::default().is_empty());
        let changes: NoteChanges =
            serde_json::from_str(r#"{"observation": "Bon travail"}"#).unwrap();
        assert!(!changes.is_empty());
    }

    #[test]
    fn grade_bounds() {
        assert!(grade_in_range(&"0".parse().unwrap()).is_ok());
        assert!(grade_in_range(&"20.00".parse().unwrap()).is_ok());
        assert!(grade_in_range(&"13.75".parse().unwrap()).is_ok());
        assert!(grade_in_range(&"20.01".parse().unwrap()).is_err());
        assert!(grade_in_range(&"-1".parse().unwrap()).is_err());
        assert!(grade_in_range(&"12.125".parse().unwrap()).is_err());
    }

    #[test]
    fn new_note_validation_uses_grade_rule() {
        let note: NewNote = serde_json::from_str(
            r#"{"matricule": "ANNOUR25-001", "libelle": "Test d'entrée", "valeur": 21}"#,
        )
        .unwrap();
        assert!(note.validate().is_err());
        assert!(note.date_enregistrement.is_none());
    }

    #[test]
    fn participant_requires_commune_and_statut() {
        let missing = serde_json::from_str::<NewSeminariste>(
            r#"{"nom": "Koné", "prenom": "Ali", "genre": "Homme", "statut": "Élève"}"#,
        );
        assert!(missing.is_err());

        let empty: NewSeminariste = serde_json::from_str(
            r#"{"nom": "Koné", "prenom": "Ali", "genre": "Homme", "commune": "", "statut": "Élève"}"#,
        )
        .unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn birth_date_cannot_be_in_future() {
        let tomorrow = Local::now().date_naive().succ_opt().unwrap();
        assert!(not_in_future(&tomorrow).is_err());
        assert!(not_in_future(&NaiveDate::from_ymd_opt(2010, 5, 1).unwrap()).is_ok());
    }

    #[test]
    fn seminariste_query_defaults_and_limits() {
        let query = SeminaristeQuery::default();
        assert_eq!((query.page, query.limit), (1, 20));
        assert!(query.validate().is_ok());

        let too_many = SeminaristeQuery {
            limit: 500,
            ..SeminaristeQuery::default()
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn explicit_null_clears_nullable_fields() {
        let changes: SeminaristeChanges = serde_json::from_str(r#"{"allergies": null}"#).unwrap();
        assert_eq!(changes.allergies, Some(None));
        assert_eq!(changes.contact, None);
        assert!(!changes.is_empty());

        let visit: ConsultationChanges = serde_json::from_str(r#"{"diagnostic": null}"#).unwrap();
        assert!(!visit.is_empty());

        let note: NoteChanges = serde_json::from_str(r#"{"observation": null}"#).unwrap();
        assert_eq!(note.observation, Some(None));
        assert!(note.valeur.is_none());
    }

    #[test]
    fn changes_check_dates_and_lengths() {
        let tomorrow = Local::now().date_naive().succ_opt().unwrap();
        let changes = SeminaristeChanges {
            date_naissance: Some(Some(tomorrow)),
            ..SeminaristeChanges::default()
        };
        assert!(changes.validate().is_err());

        let changes = SeminaristeChanges {
            contact: Some(Some("0".repeat(51))),
            ..SeminaristeChanges::default()
        };
        assert!(changes.validate().is_err());

        let changes = SeminaristeChanges {
            date_naissance: Some(None),
            contact: Some(Some("+225 07 00 00 00".into())),
            ..SeminaristeChanges::default()
        };
        assert!(changes.validate().is_ok());
    }

    #[test]
    fn grades_accept_json_numbers() {
        let note: NewNote = serde_json::from_str(
            r#"{"matricule": "ANNOUR25-001", "libelle": "Fiqh", "valeur": 12.3}"#,
        )
        .unwrap();
        assert_eq!(note.valeur, "12.3".parse::<BigDecimal>().unwrap());
        assert!(note.validate().is_ok());

        let note: NewNote =
            serde_json::from_str(r#"{"matricule": "X", "libelle": "Fiqh", "valeur": "14.10"}"#)
                .unwrap();
        assert!(note.validate().is_ok());

        let note: NewNote =
            serde_json::from_str(r#"{"matricule": "X", "libelle": "Fiqh", "valeur": 12.345}"#)
                .unwrap();
        assert!(note.validate().is_err());

        let changes: NoteChanges = serde_json::from_str(r#"{"valeur": 15.75}"#).unwrap();
        assert_eq!(changes.valeur, Some("15.75".parse().unwrap()));
        assert!(changes.validate().is_ok());

        assert!(serde_json::from_str::<NoteChanges>(r#"{"valeur": true}"#).is_err());
    }
}
