//! The reference data every deployment needs before domain records exist.

use super::{reference, text, SeedRecordSet};

pub const STATUSES: &str = "statuses";
pub const SEXES: &str = "sexes";
pub const ROLES: &str = "roles";
pub const GENRES: &str = "genres";
pub const COUNTRIES: &str = "countries";

/// Status every seeded genre and country starts in.
pub const ACTIVE_STATUS: &str = "Activo";

/// Tables created by the reference migration, in dependency order.
pub const REFERENCE_TABLES: [&str; 5] = [STATUSES, SEXES, ROLES, GENRES, COUNTRIES];

/// Reference sets in dependency order.
pub fn reference_sets() -> Vec<SeedRecordSet> {
    vec![statuses(), sexes(), roles(), genres(), countries()]
}

fn statuses() -> SeedRecordSet {
    [
        ("Activo", "Registro habilitado"),
        ("Inactivo", "Registro deshabilitado temporalmente"),
        ("Pendiente", "En espera de revisión"),
        ("Suspendido", "Bloqueado por incumplimiento"),
        ("Eliminado", "Borrado lógico"),
    ]
    .into_iter()
    .fold(SeedRecordSet::new(STATUSES, "name"), |set, (name, description)| {
        set.record([("name", text(name)), ("description", text(description))])
    })
}

fn sexes() -> SeedRecordSet {
    [
        ("Masculino", "M"),
        ("Femenino", "F"),
        ("Otro", "O"),
        ("Prefiero no decirlo", "N"),
    ]
    .into_iter()
    .fold(SeedRecordSet::new(SEXES, "name"), |set, (name, code)| {
        set.record([("name", text(name)), ("code", text(code))])
    })
}

fn roles() -> SeedRecordSet {
    [
        ("Administrador", "Acceso total a la plataforma"),
        ("Moderador", "Revisa y aprueba contenido"),
        ("Editor", "Gestiona el catálogo"),
        ("Usuario", "Cuenta registrada estándar"),
        ("Invitado", "Acceso de solo lectura"),
    ]
    .into_iter()
    .fold(SeedRecordSet::new(ROLES, "name"), |set, (name, description)| {
        set.record([("name", text(name)), ("description", text(description))])
    })
}

fn genres() -> SeedRecordSet {
    [
        "Acción",
        "Aventura",
        "Animación",
        "Comedia",
        "Ciencia ficción",
        "Documental",
        "Drama",
        "Fantasía",
        "Musical",
        "Romance",
        "Suspenso",
        "Terror",
    ]
    .into_iter()
    .fold(SeedRecordSet::new(GENRES, "name"), |set, name| {
        set.record([
            ("name", text(name)),
            ("status_id", reference(STATUSES, ACTIVE_STATUS)),
        ])
    })
}

fn countries() -> SeedRecordSet {
    [
        ("Argentina", "AR"),
        ("Brasil", "BR"),
        ("Chile", "CL"),
        ("Colombia", "CO"),
        ("Ecuador", "EC"),
        ("España", "ES"),
        ("Estados Unidos", "US"),
        ("México", "MX"),
        ("Perú", "PE"),
        ("Venezuela", "VE"),
    ]
    .into_iter()
    .fold(SeedRecordSet::new(COUNTRIES, "name"), |set, (name, iso_code)| {
        set.record([
            ("name", text(name)),
            ("iso_code", text(iso_code)),
            ("status_id", reference(STATUSES, ACTIVE_STATUS)),
        ])
    })
}
