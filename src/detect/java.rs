//! Java command detection: Gradle vs Maven, preferring project wrappers.

use std::path::Path;

use crate::allowlist::AllowedCommands;

use super::{file_exists, pick_first_allowed};

pub(super) fn detect_java_commands(
    repo: &Path,
    allowed: &AllowedCommands,
) -> (String, String, String) {
    let is_gradle =
        file_exists(&repo.join("build.gradle")) || file_exists(&repo.join("build.gradle.kts"));
    let has_maven_wrapper = file_exists(&repo.join("mvnw"));
    let has_gradle_wrapper = file_exists(&repo.join("gradlew"));

    if is_gradle {
        let (prebuild, build) = if has_gradle_wrapper {
            (
                vec![
                    "./gradlew dependencies".to_string(),
                    "gradle dependencies".to_string(),
                ],
                vec![
                    "./gradlew build -x test".to_string(),
                    "gradle build -x test".to_string(),
                ],
            )
        } else {
            (
                vec!["gradle dependencies".to_string()],
                vec!["gradle build -x test".to_string()],
            )
        };

        return (
            pick_first_allowed(&prebuild, &allowed.prebuild),
            pick_first_allowed(&build, &allowed.build),
            pick_first_allowed(&["java -jar build/libs/*.jar".to_string()], &allowed.run),
        );
    }

    let (prebuild, build) = if has_maven_wrapper {
        (
            vec!["./mvnw clean".to_string(), "mvn clean".to_string()],
            vec![
                "./mvnw install -DskipTests".to_string(),
                "mvn install -DskipTests".to_string(),
            ],
        )
    } else {
        (
            vec!["mvn clean".to_string()],
            vec!["mvn install -DskipTests".to_string()],
        )
    };

    (
        pick_first_allowed(&prebuild, &allowed.prebuild),
        pick_first_allowed(&build, &allowed.build),
        pick_first_allowed(&["java -jar target/*.jar".to_string()], &allowed.run),
    )
}
